//! Reads the producer's state file and emits validated snapshot changes.

use crate::dispatch::CoreHandle;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Discriminant every state payload must carry in its `type` field.
pub const STATE_TYPE: &str = "state";

/// Snapshot served before the first valid state file has been read.
pub const DEFAULT_SNAPSHOT_PAYLOAD: &str = r#"{"type":"state","timestamp":0,"instances":[]}"#;

/// Map size announced to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MapDimensions {
    /// Map width.
    pub width: f64,
    /// Map height.
    pub height: f64,
}

/// The current serialized state and its logical timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    /// Payload pushed to viewers verbatim.
    pub payload: Arc<str>,
    /// Logical timestamp embedded in the payload.
    pub timestamp: f64,
    /// Map dimensions embedded in the payload, if any.
    pub map_dimensions: Option<MapDimensions>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            payload: Arc::from(DEFAULT_SNAPSHOT_PAYLOAD),
            timestamp: 0.0,
            map_dimensions: None,
        }
    }
}

/// Ways a parsed state payload can have the wrong shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SnapshotError {
    /// The payload is not a JSON object.
    #[error("payload is not an object")]
    NotAnObject,
    /// The `type` field is missing or not `"state"`.
    #[error("payload type is not \"state\"")]
    WrongType,
    /// The `timestamp` field is missing or not a finite number.
    #[error("timestamp is missing or not a finite number")]
    BadTimestamp,
    /// The `instances` field is missing or not an array.
    #[error("instances is missing or not an array")]
    BadInstances,
    /// `mapDimensions` is present but lacks numeric width and height.
    #[error("mapDimensions must have numeric width and height")]
    BadMapDimensions,
}

fn finite(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64).filter(|v| v.is_finite())
}

/// Check the shape of a parsed state payload and build a [`Snapshot`] from it.
pub fn validate_state(raw: &str, value: &Value) -> Result<Snapshot, SnapshotError> {
    let obj = value.as_object().ok_or(SnapshotError::NotAnObject)?;

    if obj.get("type").and_then(Value::as_str) != Some(STATE_TYPE) {
        return Err(SnapshotError::WrongType);
    }
    let timestamp = finite(obj.get("timestamp")).ok_or(SnapshotError::BadTimestamp)?;
    if !obj.get("instances").is_some_and(Value::is_array) {
        return Err(SnapshotError::BadInstances);
    }

    let map_dimensions = match obj.get("mapDimensions") {
        None => None,
        Some(dims) => {
            let width = finite(dims.get("width")).ok_or(SnapshotError::BadMapDimensions)?;
            let height = finite(dims.get("height")).ok_or(SnapshotError::BadMapDimensions)?;
            Some(MapDimensions { width, height })
        }
    };

    Ok(Snapshot {
        payload: Arc::from(raw),
        timestamp,
        map_dimensions,
    })
}

/// Polls the state file and reports a snapshot only when its timestamp moves.
#[derive(Debug)]
pub struct StatePoller {
    path: PathBuf,
    last_timestamp: Option<f64>,
}

impl StatePoller {
    /// Create a poller for `path`. Nothing has been broadcast yet.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_timestamp: None,
        }
    }

    /// Timestamp of the last snapshot this poller reported.
    #[must_use]
    pub fn last_timestamp(&self) -> Option<f64> {
        self.last_timestamp
    }

    /// Read the file once.
    ///
    /// Returns `None` when the file is unreadable or unparsable (it may be
    /// mid-write), when the payload has the wrong shape, or when its
    /// timestamp equals the last reported one.
    pub async fn poll(&mut self) -> Option<Snapshot> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "state file not readable");
                return None;
            }
        };
        self.accept(&text)
    }

    /// Poll every `period` and publish changes to the dispatcher until
    /// `shutdown` fires or the dispatcher goes away.
    ///
    /// Each poll completes before the next tick is taken, so reads never overlap.
    pub async fn run(mut self, core: CoreHandle, period: Duration, mut shutdown: watch::Receiver<()>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let period_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        info!(path = %self.path.display(), period_ms, "state poller started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Some(snapshot) = self.poll().await {
                        debug!(timestamp = snapshot.timestamp, "state changed");
                        if core.publish(snapshot).is_err() {
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("state poller stopped");
    }

    /// Apply validation and deduplication to file content.
    pub fn accept(&mut self, text: &str) -> Option<Snapshot> {
        let raw = text.trim();
        let value: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "state file not parsable");
                return None;
            }
        };

        let snapshot = match validate_state(raw, &value) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "discarding malformed state payload");
                return None;
            }
        };

        // Deduplicated on timestamp only: different content under the same
        // timestamp is treated as unchanged.
        if self.last_timestamp == Some(snapshot.timestamp) {
            return None;
        }
        self.last_timestamp = Some(snapshot.timestamp);
        Some(snapshot)
    }
}
