use axum::{http::StatusCode, response::Json, routing::get, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Readiness check response.
#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}

/// Shared readiness state.
#[derive(Clone, Default)]
pub struct HealthState {
    ready: Arc<AtomicBool>,
}

impl HealthState {
    /// Create a health state that reports not-ready until the relay is serving.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the service as ready.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    /// Check if the service is ready.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }
}

/// Serve `/metrics`, `/health` and `/ready` on `addr`.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or binding fails.
pub async fn start_metrics_server(
    addr: SocketAddr,
    health_state: HealthState,
) -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    let app = Router::new()
        .route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(health_state.clone())));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("metrics server listening on {}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

/// Health check handler - returns 200 if server is running.
async fn health_handler() -> (StatusCode, Json<HealthResponse>) {
    (StatusCode::OK, Json(HealthResponse { status: "healthy" }))
}

/// Readiness check handler - returns 200 if ready, 503 if not.
async fn ready_handler(state: HealthState) -> (StatusCode, Json<ReadyResponse>) {
    if state.is_ready() {
        (
            StatusCode::OK,
            Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadyResponse {
                status: "not ready",
                ready: false,
            }),
        )
    }
}

/// Connection count gauges.
pub mod gauges {
    /// Set the open-connections gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn connections_open(count: usize) {
        metrics::gauge!("statecast_connections_open").set(count as f64);
    }

    /// Set the stored-session-tokens gauge.
    #[allow(clippy::cast_precision_loss)]
    pub fn session_tokens(count: usize) {
        metrics::gauge!("statecast_session_tokens").set(count as f64);
    }
}

/// Event counters.
pub mod counters {
    /// Record a channel-upgrade admission with the given outcome label.
    pub fn admissions_total(outcome: &'static str) {
        metrics::counter!("statecast_admissions_total", "outcome" => outcome).increment(1);
    }

    /// Record a token request with the given outcome label.
    pub fn token_requests_total(outcome: &'static str) {
        metrics::counter!("statecast_token_requests_total", "outcome" => outcome).increment(1);
    }

    /// Increment the broadcast snapshots counter.
    pub fn snapshots_broadcast_total() {
        metrics::counter!("statecast_snapshots_broadcast_total").increment(1);
    }

    /// Record a frame that could not be queued for a connection.
    pub fn send_failures_total(reason: &'static str) {
        metrics::counter!("statecast_send_failures_total", "reason" => reason).increment(1);
    }

    /// Increment the heartbeat evictions counter.
    pub fn evictions_total() {
        metrics::counter!("statecast_evictions_total").increment(1);
    }
}

/// Latency histograms.
pub mod histograms {
    /// Record how long one broadcast fan-out took, in seconds.
    pub fn broadcast_fanout_seconds(value: f64) {
        metrics::histogram!("statecast_broadcast_fanout_seconds").record(value);
    }
}
