use crate::dispatch::{CoreHandle, Joined};
use crate::error::StatecastError;
use crate::registry::{Outbound, Stop};
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use tokio::time::{timeout, Duration};

type WsSink = SplitSink<WebSocket, Message>;
type WsRecv = SplitStream<WebSocket>;

/// Upper bound on a single socket write; a peer that cannot absorb a frame
/// in this time is dropped.
const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Why the message loop ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    PeerClosed,
    Terminated,
    Shutdown,
}

async fn send(ws_tx: &mut WsSink, msg: Message) -> Result<(), StatecastError> {
    match timeout(SEND_TIMEOUT, ws_tx.send(msg)).await {
        Ok(result) => result.map_err(StatecastError::WebSocket),
        Err(_) => Err(StatecastError::SendTimeout),
    }
}

/// Pump queued frames to the socket and watch for liveness responses.
/// Inbound data frames are ignored.
///
/// The stop signal is checked first, then control frames, then the latest
/// state payload, so a terminated connection writes nothing further and a
/// slow peer only ever receives the newest snapshot.
async fn run_message_loop(
    ws_tx: &mut WsSink,
    ws_rx: &mut WsRecv,
    joined: &mut Joined,
    core: &CoreHandle,
) -> Result<Exit, StatecastError> {
    let mailbox = &mut joined.mailbox;
    loop {
        tokio::select! {
            biased;
            stop = &mut mailbox.stop => match stop {
                Ok(Stop::Shutdown) => {
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: Cow::Borrowed("server shutting down"),
                    };
                    let _ = send(ws_tx, Message::Close(Some(frame))).await;
                    return Ok(Exit::Shutdown);
                }
                // Unregistered by the dispatcher: drop the socket without a handshake.
                Err(_) => return Ok(Exit::Terminated),
            },
            frame = mailbox.control.recv() => match frame {
                Some(Outbound::Text(text)) => send(ws_tx, Message::Text(text.to_string())).await?,
                Some(Outbound::Ping) => send(ws_tx, Message::Ping(Vec::new())).await?,
                None => return Ok(Exit::Terminated),
            },
            changed = mailbox.state.changed() => match changed {
                Ok(()) => {
                    let payload = mailbox.state.borrow_and_update().to_string();
                    send(ws_tx, Message::Text(payload)).await?;
                }
                Err(_) => return Ok(Exit::Terminated),
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Pong(_))) => core.alive(joined.id),
                Some(Ok(Message::Close(_))) | None => return Ok(Exit::PeerClosed),
                Some(Err(e)) => return Err(StatecastError::WebSocket(e)),
                Some(Ok(_)) => {}
            }
        }
    }
}

/// Drive an admitted push channel until it closes.
///
/// The connection unregisters itself when `joined` is dropped at the end.
pub async fn handle_connection(socket: WebSocket, mut joined: Joined, core: CoreHandle) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    tracing::debug!(conn_id = joined.id, ip = %joined.ip, "push channel open");

    match run_message_loop(&mut ws_tx, &mut ws_rx, &mut joined, &core).await {
        Ok(exit) => {
            tracing::debug!(conn_id = joined.id, ip = %joined.ip, ?exit, "push channel closed");
        }
        Err(e) => {
            tracing::debug!(conn_id = joined.id, ip = %joined.ip, error = %e, "push channel failed");
        }
    }
}
