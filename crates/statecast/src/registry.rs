use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};

/// Identifier assigned to a connection at registration.
pub type ConnId = u64;

/// Control frames queued for a connection's socket task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Text frame sent ahead of any pending state.
    Text(Arc<str>),
    /// Liveness probe.
    Ping,
}

/// How the dispatcher ends a connection when it does not simply drop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stop {
    /// Send a close frame, then exit.
    Shutdown,
}

/// Control frames queued per connection before further probes are dropped.
pub const CONTROL_QUEUE: usize = 16;

/// An open push channel as seen by the dispatcher.
///
/// State payloads go through a single-slot `watch` so that a newer snapshot
/// replaces one the socket task has not written yet. Dropping the record
/// drops `stop`, which makes the socket task exit without writing anything
/// else.
#[derive(Debug)]
pub struct Connection {
    /// Registry-assigned identifier.
    pub id: ConnId,
    /// Client IP the connection is accounted against.
    pub ip: IpAddr,
    /// When the channel was admitted.
    pub connected_at: Instant,
    /// Last time the peer answered a liveness probe.
    pub last_liveness_at: Instant,
    /// Welcome message and probes, in order.
    pub control: mpsc::Sender<Outbound>,
    /// Latest state payload not yet written.
    pub state: watch::Sender<Arc<str>>,
    /// Termination signal.
    pub stop: oneshot::Sender<Stop>,
}

/// Receiving side of a [`Connection`], owned by its socket task.
#[derive(Debug)]
pub struct Mailbox {
    /// Control frames.
    pub control: mpsc::Receiver<Outbound>,
    /// State payloads, coalesced to the newest.
    pub state: watch::Receiver<Arc<str>>,
    /// Resolves on graceful shutdown, or with an error when the connection
    /// was terminated.
    pub stop: oneshot::Receiver<Stop>,
}

impl Connection {
    /// Create a connection record admitted at `now` and its mailbox.
    #[must_use]
    pub fn open(id: ConnId, ip: IpAddr, now: Instant) -> (Self, Mailbox) {
        let (control_tx, control_rx) = mpsc::channel(CONTROL_QUEUE);
        let (state_tx, state_rx) = watch::channel(Arc::<str>::from(""));
        let (stop_tx, stop_rx) = oneshot::channel();
        let conn = Self {
            id,
            ip,
            connected_at: now,
            last_liveness_at: now,
            control: control_tx,
            state: state_tx,
            stop: stop_tx,
        };
        let mailbox = Mailbox {
            control: control_rx,
            state: state_rx,
            stop: stop_rx,
        };
        (conn, mailbox)
    }
}

/// Live set of open connections plus per-IP counts.
///
/// Connections iterate in registration order because ids are handed out
/// monotonically.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    conns: BTreeMap<ConnId, Connection>,
    per_ip: HashMap<IpAddr, usize>,
    next_id: ConnId,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve the next connection id.
    pub fn next_id(&mut self) -> ConnId {
        self.next_id += 1;
        self.next_id
    }

    /// Insert a connection and count it against its IP.
    pub fn register(&mut self, conn: Connection) {
        let ip = conn.ip;
        if let Some(old) = self.conns.insert(conn.id, conn) {
            // Same id registered twice: keep the count in step with the set.
            self.release_ip(old.ip);
        }
        *self.per_ip.entry(ip).or_insert(0) += 1;
    }

    /// Remove a connection, returning it if it was registered.
    pub fn unregister(&mut self, id: ConnId) -> Option<Connection> {
        let conn = self.conns.remove(&id)?;
        self.release_ip(conn.ip);
        Some(conn)
    }

    fn release_ip(&mut self, ip: IpAddr) {
        if let Some(count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_ip.remove(&ip);
            }
        }
    }

    /// Look up a connection.
    #[must_use]
    pub fn get(&self, id: ConnId) -> Option<&Connection> {
        self.conns.get(&id)
    }

    /// Record a liveness response. Returns `false` for unknown ids.
    pub fn touch(&mut self, id: ConnId, now: Instant) -> bool {
        match self.conns.get_mut(&id) {
            Some(conn) => {
                conn.last_liveness_at = now;
                true
            }
            None => false,
        }
    }

    /// Number of open connections.
    #[must_use]
    pub fn size(&self) -> usize {
        self.conns.len()
    }

    /// Number of open connections from `ip`.
    #[must_use]
    pub fn per_ip_size(&self, ip: IpAddr) -> usize {
        self.per_ip.get(&ip).copied().unwrap_or(0)
    }

    /// Number of distinct IPs with open connections.
    #[must_use]
    pub fn distinct_ips(&self) -> usize {
        self.per_ip.len()
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    /// Visit every open connection in registration order.
    pub fn for_each_open<F>(&self, mut f: F)
    where
        F: FnMut(&Connection),
    {
        for conn in self.conns.values() {
            f(conn);
        }
    }

    /// Remove and return every connection.
    pub fn drain(&mut self) -> Vec<Connection> {
        self.per_ip.clear();
        std::mem::take(&mut self.conns).into_values().collect()
    }
}
