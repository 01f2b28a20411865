use crate::metrics::{counters, histograms};
use crate::poller::{MapDimensions, Snapshot};
use crate::registry::{Connection, ConnectionRegistry, Outbound};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

/// First frame every viewer receives.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Welcome<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: &'a str,
    map_dimensions: MapDimensions,
    update_interval_ms: u64,
}

/// Static parts of the welcome message.
#[derive(Debug, Clone)]
pub struct WelcomeTemplate {
    /// Greeting text.
    pub message: String,
    /// Dimensions used when the current snapshot carries none.
    pub default_dimensions: MapDimensions,
    /// Poll period advertised to viewers.
    pub update_interval_ms: u64,
}

/// Holds the last known-good snapshot and fans it out.
#[derive(Debug)]
pub struct BroadcastHub {
    snapshot: Snapshot,
    welcome: WelcomeTemplate,
}

/// Queue a control frame without waiting. Returns `false` if the queue refused it.
pub(crate) fn offer(conn: &Connection, frame: Outbound) -> bool {
    match conn.control.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            counters::send_failures_total("full");
            warn!(conn_id = conn.id, ip = %conn.ip, "control queue full, frame dropped");
            false
        }
        Err(TrySendError::Closed(_)) => {
            counters::send_failures_total("closed");
            debug!(conn_id = conn.id, ip = %conn.ip, "control queue closed, frame dropped");
            false
        }
    }
}

/// Store `payload` as the connection's pending state, replacing any payload
/// its socket task has not written yet. Returns `false` if the task is gone.
pub(crate) fn push_state(conn: &Connection, payload: &Arc<str>) -> bool {
    if conn.state.is_closed() {
        counters::send_failures_total("closed");
        debug!(conn_id = conn.id, ip = %conn.ip, "socket task gone, state dropped");
        return false;
    }
    conn.state.send_replace(Arc::clone(payload));
    true
}

impl BroadcastHub {
    /// Create a hub holding the default empty snapshot.
    #[must_use]
    pub fn new(welcome: WelcomeTemplate) -> Self {
        Self {
            snapshot: Snapshot::default(),
            welcome,
        }
    }

    /// The snapshot currently served to new viewers.
    #[must_use]
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Serialized welcome message reflecting the current snapshot.
    #[must_use]
    pub fn welcome_message(&self) -> String {
        let welcome = Welcome {
            kind: "welcome",
            message: &self.welcome.message,
            map_dimensions: self
                .snapshot
                .map_dimensions
                .unwrap_or(self.welcome.default_dimensions),
            update_interval_ms: self.welcome.update_interval_ms,
        };
        // Serializing a struct of strings and numbers cannot fail.
        serde_json::to_string(&welcome).unwrap_or_default()
    }

    /// Send the welcome message and the current snapshot to a new viewer.
    ///
    /// The socket task drains control frames first, so the welcome is written
    /// before the snapshot.
    pub fn on_join(&self, conn: &Connection) {
        offer(conn, Outbound::Text(Arc::from(self.welcome_message())));
        push_state(conn, &self.snapshot.payload);
    }

    /// Replace the held snapshot and push it to every open connection.
    ///
    /// Returns how many connections accepted the frame.
    pub fn on_snapshot_update(&mut self, registry: &ConnectionRegistry, snapshot: Snapshot) -> usize {
        let start = Instant::now();
        self.snapshot = snapshot;

        let mut delivered = 0;
        registry.for_each_open(|conn| {
            if push_state(conn, &self.snapshot.payload) {
                delivered += 1;
            }
        });

        counters::snapshots_broadcast_total();
        histograms::broadcast_fanout_seconds(start.elapsed().as_secs_f64());
        debug!(
            timestamp = self.snapshot.timestamp,
            recipients = registry.size(),
            delivered,
            "snapshot broadcast"
        );
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnId, Mailbox};
    use serde_json::Value;

    fn template() -> WelcomeTemplate {
        WelcomeTemplate {
            message: "hi".to_string(),
            default_dimensions: MapDimensions {
                width: 100.0,
                height: 50.0,
            },
            update_interval_ms: 1000,
        }
    }

    fn join(registry: &mut ConnectionRegistry) -> (ConnId, Mailbox) {
        let id = registry.next_id();
        let (conn, mailbox) = Connection::open(id, "10.0.0.1".parse().unwrap(), Instant::now());
        registry.register(conn);
        (id, mailbox)
    }

    fn text(frame: Outbound) -> String {
        match frame {
            Outbound::Text(t) => t.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    /// Take the pending state payload, if one arrived since the last take.
    fn take_state(mailbox: &mut Mailbox) -> Option<String> {
        if mailbox.state.has_changed().unwrap_or(false) {
            Some(mailbox.state.borrow_and_update().to_string())
        } else {
            None
        }
    }

    fn snapshot(ts: f64, payload: &str) -> Snapshot {
        Snapshot {
            payload: Arc::from(payload),
            timestamp: ts,
            map_dimensions: None,
        }
    }

    #[test]
    fn join_sends_welcome_then_snapshot() {
        let hub = BroadcastHub::new(template());
        let mut registry = ConnectionRegistry::new();
        let (id, mut mailbox) = join(&mut registry);
        hub.on_join(registry.get(id).unwrap());

        let welcome: Value =
            serde_json::from_str(&text(mailbox.control.try_recv().unwrap())).unwrap();
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["message"], "hi");
        assert_eq!(welcome["mapDimensions"]["width"], 100.0);
        assert_eq!(welcome["mapDimensions"]["height"], 50.0);
        assert_eq!(welcome["updateIntervalMs"], 1000);
        assert!(mailbox.control.try_recv().is_err());

        assert_eq!(
            take_state(&mut mailbox).as_deref(),
            Some(crate::poller::DEFAULT_SNAPSHOT_PAYLOAD)
        );
        assert_eq!(take_state(&mut mailbox), None);
    }

    #[test]
    fn welcome_uses_snapshot_dimensions() {
        let mut hub = BroadcastHub::new(template());
        let registry = ConnectionRegistry::new();
        let mut s = snapshot(1.0, "{}");
        s.map_dimensions = Some(MapDimensions {
            width: 7.0,
            height: 9.0,
        });
        hub.on_snapshot_update(&registry, s);
        let welcome: Value = serde_json::from_str(&hub.welcome_message()).unwrap();
        assert_eq!(welcome["mapDimensions"]["width"], 7.0);
    }

    #[test]
    fn update_reaches_every_connection_with_identical_payload() {
        let mut hub = BroadcastHub::new(template());
        let mut registry = ConnectionRegistry::new();
        let mut mailboxes: Vec<_> = (0..3).map(|_| join(&mut registry).1).collect();

        let delivered = hub.on_snapshot_update(&registry, snapshot(5.0, "payload-5"));
        assert_eq!(delivered, 3);
        for mailbox in &mut mailboxes {
            assert_eq!(take_state(mailbox).as_deref(), Some("payload-5"));
        }
        assert_eq!(&*hub.snapshot().payload, "payload-5");
    }

    #[test]
    fn failing_connection_does_not_stop_broadcast() {
        let mut hub = BroadcastHub::new(template());
        let mut registry = ConnectionRegistry::new();
        let (_, mut first) = join(&mut registry);
        let (dead_id, dead) = join(&mut registry);
        let (_, mut last) = join(&mut registry);
        drop(dead);

        let delivered = hub.on_snapshot_update(&registry, snapshot(1.0, "x"));
        assert_eq!(delivered, 2);
        assert_eq!(take_state(&mut first).as_deref(), Some("x"));
        assert_eq!(take_state(&mut last).as_deref(), Some("x"));
        // Left for the close path / heartbeat to clean up.
        assert!(registry.get(dead_id).is_some());
    }

    #[test]
    fn slow_viewer_gets_latest_snapshot_not_backlog() {
        let mut hub = BroadcastHub::new(template());
        let mut registry = ConnectionRegistry::new();
        let (_, mut mailbox) = join(&mut registry);

        for ts in 1..=70 {
            let payload = format!("ts-{ts}");
            assert_eq!(hub.on_snapshot_update(&registry, snapshot(f64::from(ts), &payload)), 1);
        }
        assert_eq!(take_state(&mut mailbox).as_deref(), Some("ts-70"));
        assert_eq!(take_state(&mut mailbox), None);
    }

    #[test]
    fn full_control_queue_drops_ping() {
        let mut registry = ConnectionRegistry::new();
        let (id, mut mailbox) = join(&mut registry);
        let conn = registry.get(id).unwrap();

        for _ in 0..crate::registry::CONTROL_QUEUE {
            assert!(offer(conn, Outbound::Ping));
        }
        assert!(!offer(conn, Outbound::Ping));
        let mut queued = 0;
        while mailbox.control.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, crate::registry::CONTROL_QUEUE);
    }
}
