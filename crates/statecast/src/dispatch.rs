//! The dispatch task that owns all mutable relay state.
//!
//! Token issuance, channel admission, snapshot fan-out, liveness updates and
//! the periodic heartbeat/sweep passes all run here, one command at a time.
//! Other tasks talk to it through a [`CoreHandle`].

use crate::admission::{admit_new_connection, session_token_param, ConnectionLimits};
use crate::config::ServerConfig;
use crate::error::{Rejection, StatecastError};
use crate::heartbeat::HeartbeatMonitor;
use crate::hub::{BroadcastHub, WelcomeTemplate};
use crate::metrics::gauges;
use crate::poller::{MapDimensions, Snapshot};
use crate::registry::{ConnId, Connection, ConnectionRegistry, Mailbox, Stop};
use crate::tokens::{IssuedToken, SessionTokenStore};
use std::net::IpAddr;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, MissedTickBehavior};
use tracing::{debug, info};

/// A channel-upgrade request that passed the origin check.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    /// Client IP the connection is accounted against.
    pub ip: IpAddr,
    /// `Origin` header, if any.
    pub origin: Option<String>,
    /// Request path and query, carrying the `sessionToken` parameter.
    pub path_and_query: String,
}

/// An admitted connection, ready to be attached to its socket.
#[derive(Debug)]
pub struct Joined {
    /// Registry id.
    pub id: ConnId,
    /// Client IP.
    pub ip: IpAddr,
    /// Frames to write to the socket and the termination signal.
    pub mailbox: Mailbox,
    /// Unregisters the connection when dropped.
    pub guard: ConnGuard,
}

/// Reports a connection's close path to the dispatcher on drop.
#[derive(Debug)]
pub struct ConnGuard {
    id: ConnId,
    tx: mpsc::UnboundedSender<Command>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Closed(self.id));
    }
}

/// Point-in-time counts, mostly for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoreStats {
    /// Open connections.
    pub connections: usize,
    /// Distinct IPs with open connections.
    pub distinct_ips: usize,
    /// Stored session tokens.
    pub tokens: usize,
    /// Timestamp of the snapshot being served.
    pub snapshot_timestamp: f64,
}

#[derive(Debug)]
enum Command {
    IssueToken {
        ip: IpAddr,
        origin: Option<String>,
        reply: oneshot::Sender<IssuedToken>,
    },
    Join {
        request: JoinRequest,
        reply: oneshot::Sender<Result<Joined, Rejection>>,
    },
    Snapshot(Snapshot),
    Alive(ConnId),
    Closed(ConnId),
    Stats(oneshot::Sender<CoreStats>),
}

/// Cloneable sender side of the dispatcher.
#[derive(Debug, Clone)]
pub struct CoreHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoreHandle {
    fn send(&self, cmd: Command) -> Result<(), StatecastError> {
        self.tx.send(cmd).map_err(|_| StatecastError::CoreUnavailable)
    }

    /// Issue a session token bound to `(ip, origin)`.
    ///
    /// # Errors
    ///
    /// Returns [`StatecastError::CoreUnavailable`] if the dispatcher has stopped.
    pub async fn issue_token(
        &self,
        ip: IpAddr,
        origin: Option<String>,
    ) -> Result<IssuedToken, StatecastError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::IssueToken { ip, origin, reply })?;
        rx.await.map_err(|_| StatecastError::CoreUnavailable)
    }

    /// Run capacity and token admission and register the connection.
    ///
    /// # Errors
    ///
    /// Returns [`StatecastError::CoreUnavailable`] if the dispatcher has stopped.
    pub async fn join(
        &self,
        request: JoinRequest,
    ) -> Result<Result<Joined, Rejection>, StatecastError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Join { request, reply })?;
        rx.await.map_err(|_| StatecastError::CoreUnavailable)
    }

    /// Hand a validated snapshot to the broadcast hub.
    ///
    /// # Errors
    ///
    /// Returns [`StatecastError::CoreUnavailable`] if the dispatcher has stopped.
    pub fn publish(&self, snapshot: Snapshot) -> Result<(), StatecastError> {
        self.send(Command::Snapshot(snapshot))
    }

    /// Record a liveness response from `id`.
    pub fn alive(&self, id: ConnId) {
        let _ = self.send(Command::Alive(id));
    }

    /// Current counts.
    ///
    /// # Errors
    ///
    /// Returns [`StatecastError::CoreUnavailable`] if the dispatcher has stopped.
    pub async fn stats(&self) -> Result<CoreStats, StatecastError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Stats(reply))?;
        rx.await.map_err(|_| StatecastError::CoreUnavailable)
    }
}

/// Owner of the token store, registry and hub.
pub struct Core {
    tokens: SessionTokenStore,
    registry: ConnectionRegistry,
    hub: BroadcastHub,
    heartbeat: HeartbeatMonitor,
    limits: ConnectionLimits,
    ping_interval: Duration,
    sweep_interval: Duration,
    self_tx: mpsc::UnboundedSender<Command>,
}

impl Core {
    /// Start the dispatcher. It runs until `shutdown` changes or its sender
    /// is dropped, then closes every open connection.
    #[must_use]
    pub fn spawn(config: &ServerConfig, shutdown: watch::Receiver<()>) -> (CoreHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = Self {
            tokens: SessionTokenStore::new(config.token_ttl()),
            registry: ConnectionRegistry::new(),
            hub: BroadcastHub::new(WelcomeTemplate {
                message: config.welcome_message.clone(),
                default_dimensions: MapDimensions {
                    width: config.map_width,
                    height: config.map_height,
                },
                update_interval_ms: config.poll_interval_ms,
            }),
            heartbeat: HeartbeatMonitor::new(config.idle_timeout()),
            limits: ConnectionLimits::from_config(config),
            ping_interval: config.ping_interval(),
            sweep_interval: config.token_sweep_interval(),
            self_tx: tx.clone(),
        };
        let task = tokio::spawn(core.run(rx, shutdown));
        (CoreHandle { tx }, task)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, mut shutdown: watch::Receiver<()>) {
        let start = tokio::time::Instant::now();
        let mut heartbeat = interval_at(start + self.ping_interval, self.ping_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sweep = interval_at(start + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = heartbeat.tick() => {
                    self.heartbeat.tick(&mut self.registry, Instant::now());
                    gauges::connections_open(self.registry.size());
                }
                _ = sweep.tick() => {
                    let removed = self.tokens.sweep_expired();
                    if removed > 0 {
                        debug!(removed, "swept expired session tokens");
                    }
                    gauges::session_tokens(self.tokens.len());
                }
                _ = shutdown.changed() => break,
            }
        }

        self.close_all();
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::IssueToken { ip, origin, reply } => {
                let issued = self.tokens.issue(ip, origin.as_deref());
                gauges::session_tokens(self.tokens.len());
                let _ = reply.send(issued);
            }
            Command::Join { request, reply } => {
                let result = self.join(request);
                // If the requester is gone the returned guard unregisters again.
                let _ = reply.send(result);
            }
            Command::Snapshot(snapshot) => {
                self.hub.on_snapshot_update(&self.registry, snapshot);
            }
            Command::Alive(id) => {
                self.registry.touch(id, Instant::now());
            }
            Command::Closed(id) => {
                if let Some(conn) = self.registry.unregister(id) {
                    debug!(conn_id = id, ip = %conn.ip, "connection closed");
                    gauges::connections_open(self.registry.size());
                }
            }
            Command::Stats(reply) => {
                let _ = reply.send(CoreStats {
                    connections: self.registry.size(),
                    distinct_ips: self.registry.distinct_ips(),
                    tokens: self.tokens.len(),
                    snapshot_timestamp: self.hub.snapshot().timestamp,
                });
            }
        }
    }

    fn join(&mut self, request: JoinRequest) -> Result<Joined, Rejection> {
        admit_new_connection(&self.registry, request.ip, self.limits)?;
        let token = session_token_param(&request.path_and_query)?;
        self.tokens.validate(
            token.as_deref().unwrap_or_default(),
            request.ip,
            request.origin.as_deref(),
        )?;

        let id = self.registry.next_id();
        let (conn, mailbox) = Connection::open(id, request.ip, Instant::now());
        self.registry.register(conn);
        if let Some(conn) = self.registry.get(id) {
            self.hub.on_join(conn);
        }
        gauges::connections_open(self.registry.size());

        Ok(Joined {
            id,
            ip: request.ip,
            mailbox,
            guard: ConnGuard {
                id,
                tx: self.self_tx.clone(),
            },
        })
    }

    fn close_all(&mut self) {
        let conns = self.registry.drain();
        info!(count = conns.len(), "closing open connections");
        for conn in conns {
            let _ = conn.stop.send(Stop::Shutdown);
        }
        gauges::connections_open(0);
    }
}
