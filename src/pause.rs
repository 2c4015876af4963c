//! Cooperative pause/cancel coordination through the shared KV store.
//!
//! A running worker polls these flags only at checkpoint boundaries, so pause
//! latency is bounded by the checkpoint interval in candle steps, not by wall
//! time. The three operations carry deliberately different error policies:
//!
//! - [`set_pause`](PauseCoordinator::set_pause) fails loudly — pausing is a
//!   user action that requires confirmation.
//! - [`is_pause_requested`](PauseCoordinator::is_pause_requested) never
//!   raises — the safe default when the store is unreachable is to keep
//!   processing and checkpoint again soon.
//! - [`clear_pause`](PauseCoordinator::clear_pause) reports failure without
//!   raising — the key has a TTL and will expire on its own.

use std::sync::Arc;
use std::time::Duration;

use crate::kv::{KeyValueStore, KvError};

const PAUSE_VALUE: &str = "true";

/// Non-throwing result shape for callers that want `{success, error}`
/// semantics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PauseOutcome {
    pub success: bool,
    pub error: Option<String>,
}

/// Thin wrapper over the shared KV store that also backs the queue's locks.
#[derive(Clone)]
pub struct PauseCoordinator {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
}

impl PauseCoordinator {
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    fn pause_key(backtest_id: &str) -> String {
        format!("backtest:pause:{backtest_id}")
    }

    fn cancel_key(backtest_id: &str) -> String {
        format!("backtest:cancel:{backtest_id}")
    }

    /// Request a pause. Errors surface to the caller.
    pub async fn set_pause(&self, backtest_id: &str) -> Result<(), KvError> {
        self.kv
            .put(&Self::pause_key(backtest_id), PAUSE_VALUE, Some(self.ttl))
            .await
    }

    /// Non-throwing variant of [`set_pause`](Self::set_pause).
    pub async fn try_set_pause(&self, backtest_id: &str) -> PauseOutcome {
        match self.set_pause(backtest_id).await {
            Ok(()) => PauseOutcome {
                success: true,
                error: None,
            },
            Err(err) => PauseOutcome {
                success: false,
                error: Some(err.to_string()),
            },
        }
    }

    /// Whether a pause has been requested. Never raises; an unreachable
    /// store reads as "no pause".
    pub async fn is_pause_requested(&self, backtest_id: &str) -> bool {
        self.read_flag(&Self::pause_key(backtest_id)).await
    }

    /// Remove the pause flag. Returns whether a live flag was removed;
    /// store errors degrade to `false`.
    pub async fn clear_pause(&self, backtest_id: &str) -> bool {
        self.clear_flag(&Self::pause_key(backtest_id)).await
    }

    /// Request a hard cancel, observed by the worker at the next checkpoint
    /// boundary. Same error policy as [`set_pause`](Self::set_pause).
    pub async fn request_cancel(&self, backtest_id: &str) -> Result<(), KvError> {
        self.kv
            .put(&Self::cancel_key(backtest_id), PAUSE_VALUE, Some(self.ttl))
            .await
    }

    /// Never raises; an unreachable store reads as "no cancel".
    pub async fn is_cancel_requested(&self, backtest_id: &str) -> bool {
        self.read_flag(&Self::cancel_key(backtest_id)).await
    }

    pub async fn clear_cancel(&self, backtest_id: &str) -> bool {
        self.clear_flag(&Self::cancel_key(backtest_id)).await
    }

    async fn read_flag(&self, key: &str) -> bool {
        match self.kv.get(key).await {
            Ok(value) => value.as_deref() == Some(PAUSE_VALUE),
            Err(err) => {
                tracing::warn!(key, error = %err, "flag read failed; assuming not set");
                false
            }
        }
    }

    async fn clear_flag(&self, key: &str) -> bool {
        match self.kv.delete(key).await {
            Ok(removed) => removed,
            Err(err) => {
                tracing::warn!(key, error = %err, "flag clear failed; TTL will expire it");
                false
            }
        }
    }
}
