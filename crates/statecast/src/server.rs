use crate::admission::OriginPolicy;
use crate::config::ServerConfig;
use crate::dispatch::{Core, CoreHandle};
use crate::error::StatecastError;
use crate::handlers::{channel_upgrade, session_token, session_token_preflight};
use crate::poller::StatePoller;
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Shared state for the HTTP handlers.
pub struct ServerState {
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Origin/Host allow-list.
    pub policy: OriginPolicy,
    /// Sender side of the dispatcher.
    pub core: CoreHandle,
}

/// Build the HTTP router: the token endpoint plus the upgrade handshake on
/// every other path.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route(
            "/session-token",
            get(session_token).options(session_token_preflight),
        )
        .fallback(channel_upgrade)
        .with_state(state)
}

/// Run until the process is killed.
///
/// # Errors
///
/// Returns an error if the HTTP server encounters an I/O failure.
pub async fn run(listener: TcpListener, config: ServerConfig) -> Result<(), StatecastError> {
    let (_shutdown_tx, shutdown_rx) = watch::channel(());
    run_with_shutdown(listener, config, shutdown_rx).await
}

/// Run the relay with an externally-controlled shutdown signal.
///
/// When the watch sender sends a value or is dropped, the listener stops
/// accepting, the poll/heartbeat/sweep timers stop, and every open push
/// channel is closed.
///
/// # Errors
///
/// Returns an error if the HTTP server encounters an I/O failure.
pub async fn run_with_shutdown(
    listener: TcpListener,
    config: ServerConfig,
    shutdown: watch::Receiver<()>,
) -> Result<(), StatecastError> {
    let local_addr = listener.local_addr()?;

    let policy = OriginPolicy::from_config(&config);
    for entry in policy.malformed_entries() {
        warn!(entry, "ignoring malformed allowed origin");
    }
    if policy.is_open() {
        warn!("no allowed origins configured, accepting every origin");
    }

    let (core, core_task) = Core::spawn(&config, shutdown.clone());
    let poller_task = tokio::spawn(StatePoller::new(config.state_path.clone()).run(
        core.clone(),
        config.poll_interval(),
        shutdown.clone(),
    ));

    let state = Arc::new(ServerState {
        config,
        policy,
        core,
    });

    info!("server listening on {}", local_addr);
    let mut shutdown_rx = shutdown;
    let served = axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.changed().await;
        info!("shutdown signal received");
    })
    .await;

    if let Err(e) = core_task.await {
        warn!("dispatcher task ended abnormally: {}", e);
    }
    if let Err(e) = poller_task.await {
        warn!("poller task ended abnormally: {}", e);
    }

    served?;
    info!("server shut down gracefully");
    Ok(())
}
