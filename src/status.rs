//! Status streaming: topic-per-backtest pub/sub for lifecycle transitions
//! and progress.
//!
//! Each backtest id maps to a broadcast room; the HTTP/WebSocket layers
//! subscribe a receiver per client. Delivery is best-effort — a lagging
//! subscriber drops its oldest buffered events (counted for diagnostics),
//! and missed events can always be reconstructed from the backtest record on
//! reconnect.

use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;

/// Lifecycle and progress events published per backtest.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum StatusEvent {
    #[serde(rename_all = "camelCase")]
    Queued {
        resumed: bool,
        has_checkpoint: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        checkpoint_index: Option<u64>,
    },
    Running,
    #[serde(rename_all = "camelCase")]
    Progress { fraction: f64, index: u64 },
    Paused,
    Resumed,
    Completed,
    #[serde(rename_all = "camelCase")]
    Failed { message: String },
}

/// One published update, stamped at publish time.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub backtest_id: String,
    #[serde(flatten)]
    pub event: StatusEvent,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    #[must_use]
    pub fn new(backtest_id: impl Into<String>, event: StatusEvent) -> Self {
        Self {
            backtest_id: backtest_id.into(),
            event,
            at: Utc::now(),
        }
    }
}

/// Snapshot of stream health for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusStreamMetrics {
    /// Per-subscriber buffer before lag drops events.
    pub capacity: usize,
    /// Rooms currently open.
    pub rooms: usize,
    /// Updates published with no live subscriber.
    pub unobserved: usize,
}

/// Topic-per-backtest broadcast hub.
pub struct StatusStream {
    rooms: RwLock<FxHashMap<String, broadcast::Sender<StatusUpdate>>>,
    capacity: usize,
    unobserved: AtomicUsize,
}

impl std::fmt::Debug for StatusStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusStream")
            .field("capacity", &self.capacity)
            .field("rooms", &self.rooms.read().len())
            .finish()
    }
}

impl StatusStream {
    /// `capacity` is clamped to at least 1 to satisfy the broadcast API.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(FxHashMap::default()),
            capacity: capacity.max(1),
            unobserved: AtomicUsize::new(0),
        }
    }

    /// Join the room for one backtest, creating it on first subscribe.
    pub fn subscribe(&self, backtest_id: &str) -> broadcast::Receiver<StatusUpdate> {
        let mut rooms = self.rooms.write();
        rooms
            .entry(backtest_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to the backtest's room. Best-effort: updates for rooms with
    /// no subscribers are dropped and counted.
    pub fn publish(&self, update: StatusUpdate) {
        let sender = self.rooms.read().get(&update.backtest_id).cloned();
        match sender {
            Some(sender) => {
                if sender.send(update).is_err() {
                    self.unobserved.fetch_add(1, Ordering::Relaxed);
                }
            }
            None => {
                self.unobserved.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Convenience: stamp and publish an event for a backtest.
    pub fn emit(&self, backtest_id: &str, event: StatusEvent) {
        self.publish(StatusUpdate::new(backtest_id, event));
    }

    /// Drop a room; subscribers see the channel close.
    pub fn forget(&self, backtest_id: &str) {
        self.rooms.write().remove(backtest_id);
    }

    #[must_use]
    pub fn metrics(&self) -> StatusStreamMetrics {
        StatusStreamMetrics {
            capacity: self.capacity,
            rooms: self.rooms.read().len(),
            unobserved: self.unobserved.load(Ordering::Relaxed),
        }
    }
}
