//! statecast: pushes a periodically refreshed state snapshot to WebSocket viewers.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Origin/host allow-listing, connection quotas and client IP extraction.
pub mod admission;
/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Single-task dispatcher owning tokens, connections and the snapshot.
pub mod dispatch;
/// Error types for relay server operations.
pub mod error;
mod handlers;
/// Liveness probing and eviction of silent connections.
pub mod heartbeat;
/// Snapshot fan-out to open connections.
pub mod hub;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// State file polling and payload validation.
pub mod poller;
/// Open connections and per-IP counts.
pub mod registry;
/// HTTP router, accept loop and shutdown.
pub mod server;
/// Session token issuance and validation.
pub mod tokens;

pub use server::{router, run, run_with_shutdown, ServerState};
