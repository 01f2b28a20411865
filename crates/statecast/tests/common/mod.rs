#![allow(dead_code)]

use futures_util::StreamExt;
use serde_json::Value;
use statecast::config::ServerConfig;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderName;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const VIEWER_ORIGIN: &str = "https://viewer.example.com";

pub fn test_config(listen: SocketAddr, state_path: PathBuf) -> ServerConfig {
    ServerConfig {
        host: listen.ip(),
        port: listen.port(),
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        allowed_origins: Vec::new(),
        allow_same_host_different_port: false,
        state_path,
        poll_interval_ms: 50,
        max_conns_ip: 100,
        max_conns: 1000,
        trust_proxy: false,
        ping_interval_ms: 30_000,
        idle_timeout_ms: 120_000,
        session_token_ttl_ms: 60_000,
        map_width: 800.0,
        map_height: 600.0,
        welcome_message: "welcome aboard".to_string(),
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub dir: TempDir,
    pub shutdown: watch::Sender<()>,
    pub task: JoinHandle<()>,
}

pub async fn start_server() -> TestServer {
    start_server_with(|_| {}).await
}

pub async fn start_server_with(configure: impl FnOnce(&mut ServerConfig)) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(addr, dir.path().join("state.json"));
    configure(&mut config);

    let (shutdown, shutdown_rx) = watch::channel(());
    let task = tokio::spawn(async move {
        if let Err(e) = statecast::run_with_shutdown(listener, config, shutdown_rx).await {
            eprintln!("server error in test: {e}");
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    TestServer {
        addr,
        dir,
        shutdown,
        task,
    }
}

impl TestServer {
    pub fn state_path(&self) -> PathBuf {
        self.dir.path().join("state.json")
    }

    /// Replace the state file the way a producer would: write aside, then rename.
    pub fn write_state(&self, contents: &str) {
        write_atomically(&self.state_path(), contents);
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, query: &str) -> String {
        format!("ws://{}/live{}", self.addr, query)
    }

    pub async fn request_token(&self, origin: Option<&str>) -> reqwest::Response {
        let headers: Vec<(&str, &str)> = origin.map(|o| ("Origin", o)).into_iter().collect();
        self.request_token_with(&headers).await
    }

    pub async fn request_token_with(&self, headers: &[(&str, &str)]) -> reqwest::Response {
        let mut req = reqwest::Client::new().get(self.http_url("/session-token"));
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        req.send().await.unwrap()
    }

    /// Token fetched as a client behind a proxy that forwards `forwarded_for`.
    pub async fn token_forwarded_for(&self, forwarded_for: &str) -> String {
        let resp = self
            .request_token_with(&[("X-Forwarded-For", forwarded_for)])
            .await;
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    pub async fn connect_forwarded_for(
        &self,
        token: &str,
        forwarded_for: &str,
    ) -> Result<WsClient, WsError> {
        connect_with(
            &self.ws_url(&format!("?sessionToken={token}")),
            &[("X-Forwarded-For", forwarded_for)],
        )
        .await
    }

    pub async fn token(&self, origin: Option<&str>) -> String {
        let resp = self.request_token(origin).await;
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        body["token"].as_str().unwrap().to_string()
    }

    pub async fn connect(&self, token: &str, origin: Option<&str>) -> Result<WsClient, WsError> {
        connect(&self.ws_url(&format!("?sessionToken={token}")), origin).await
    }

    /// Connect and consume the welcome message and initial snapshot.
    pub async fn join(&self, origin: Option<&str>) -> (WsClient, Value, Value) {
        let token = self.token(origin).await;
        let mut ws = self.connect(&token, origin).await.unwrap();
        let welcome = recv_json(&mut ws).await;
        let snapshot = recv_json(&mut ws).await;
        (ws, welcome, snapshot)
    }
}

pub fn write_atomically(path: &Path, contents: &str) {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents).unwrap();
    std::fs::rename(&tmp, path).unwrap();
}

pub async fn connect(url: &str, origin: Option<&str>) -> Result<WsClient, WsError> {
    let headers: Vec<(&str, &str)> = origin.map(|o| ("Origin", o)).into_iter().collect();
    connect_with(url, &headers).await
}

pub async fn connect_with(url: &str, headers: &[(&str, &str)]) -> Result<WsClient, WsError> {
    let mut req = url.into_client_request().unwrap();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes()).unwrap();
        req.headers_mut().insert(name, value.parse().unwrap());
    }
    tokio_tungstenite::connect_async(req).await.map(|(ws, _)| ws)
}

/// Send a hand-written upgrade request for `target` and read the response
/// head. The returned stream is positioned at the first WebSocket frame.
pub async fn raw_upgrade(addr: SocketAddr, target: &str) -> (TcpStream, u16) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {target} HTTP/1.1\r\n\
         Host: {addr}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut byte))
            .await
            .expect("timeout waiting for response head")
            .unwrap();
        assert!(n > 0, "connection closed before response head");
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head);
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("malformed status line");
    (stream, status)
}

/// Read and discard until the server drops the socket. Returns `false` if it
/// is still open after `timeout`.
pub async fn wait_for_drop(stream: &mut TcpStream, timeout: Duration) -> bool {
    tokio::time::timeout(timeout, async {
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await
    .is_ok()
}

/// HTTP status of a refused handshake.
pub fn rejection_status(result: Result<WsClient, WsError>) -> u16 {
    match result {
        Err(WsError::Http(resp)) => resp.status().as_u16(),
        Err(other) => panic!("expected HTTP rejection, got {other:?}"),
        Ok(_) => panic!("expected HTTP rejection, handshake succeeded"),
    }
}

pub async fn recv_json(ws: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => {}
            other => panic!("expected text message, got {other:?}"),
        }
    }
}

/// Next text message within `timeout`, if any.
pub async fn try_recv_json(ws: &mut WsClient, timeout: Duration) -> Option<Value> {
    tokio::time::timeout(timeout, recv_json(ws)).await.ok()
}
