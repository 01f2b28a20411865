use crate::hub::offer;
use crate::metrics::counters;
use crate::registry::{ConnId, ConnectionRegistry, Outbound};
use std::time::{Duration, Instant};
use tracing::info;

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Probes connections and evicts those that stopped answering.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatMonitor {
    idle_timeout: Duration,
}

impl HeartbeatMonitor {
    /// Evict connections silent for longer than `idle_timeout`.
    #[must_use]
    pub const fn new(idle_timeout: Duration) -> Self {
        Self { idle_timeout }
    }

    /// Run one heartbeat pass as of `now`.
    ///
    /// Stale connections are unregistered and their record dropped, which
    /// makes the socket task drop the socket without a close handshake, even
    /// with frames still pending.
    /// Every other connection is sent a probe. Returns the evicted ids.
    pub fn tick(&self, registry: &mut ConnectionRegistry, now: Instant) -> Vec<ConnId> {
        let mut stale = Vec::new();
        registry.for_each_open(|conn| {
            if now.saturating_duration_since(conn.last_liveness_at) > self.idle_timeout {
                stale.push(conn.id);
            } else {
                offer(conn, Outbound::Ping);
            }
        });

        for id in &stale {
            if let Some(conn) = registry.unregister(*id) {
                counters::evictions_total();
                info!(
                    conn_id = conn.id,
                    ip = %conn.ip,
                    connected_for_ms = millis(now.saturating_duration_since(conn.connected_at)),
                    "terminating unresponsive connection"
                );
            }
        }
        stale
    }
}
