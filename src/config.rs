//! Engine configuration.
//!
//! All tunables live in a single [`EngineConfig`] passed at construction time;
//! nothing in the crate reads process-wide mutable state. The database URL is
//! the one exception to pure construction: when not supplied it is resolved
//! from the environment (`.env` files honored via `dotenvy`).

use std::time::Duration;

/// Configuration for the execution core, shared by the queue, worker,
/// checkpoint engine, recovery service, and pause coordinator.
///
/// # Examples
///
/// ```rust
/// use backtest_core::config::EngineConfig;
///
/// let config = EngineConfig::default()
///     .with_checkpoint_interval(50)
///     .with_max_auto_resume(5);
/// assert_eq!(config.checkpoint_interval, 50);
/// ```
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// SQLite URL for the durable store, e.g. `sqlite://backtests.db`.
    pub database_url: String,
    /// Queue name; part of the lock key convention
    /// `<lock_prefix>:<queue_name>:<job_id>:lock`.
    pub queue_name: String,
    /// Lock key prefix shared with the KV store.
    pub lock_prefix: String,
    /// Candle steps between checkpoints.
    pub checkpoint_interval: u64,
    /// Age beyond which a stored checkpoint is discarded instead of resumed.
    pub max_checkpoint_age: chrono::Duration,
    /// Cap on automatic recoveries per backtest before it is failed terminally.
    pub max_auto_resume: u32,
    /// TTL applied to pause/cancel flags in the KV store.
    pub pause_key_ttl: Duration,
    /// Duration of a worker's job lock; a dead worker's lock expires after
    /// this long and the job becomes eligible again.
    pub lock_duration: Duration,
    /// How long a blocking [`lease`](crate::queue::ExecutionQueue::lease)
    /// sleeps between queue polls.
    pub lease_poll_interval: Duration,
    /// Candles fetched from the market-data source per batch.
    pub fetch_batch_size: usize,
    /// Per-subscriber buffer of the status stream's broadcast rooms.
    pub status_buffer_capacity: usize,
    /// Rolling candle-history window kept per asset for indicator evaluation.
    pub indicator_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: resolve_database_url(None),
            queue_name: "backtests".into(),
            lock_prefix: "queue".into(),
            checkpoint_interval: 100,
            max_checkpoint_age: chrono::Duration::days(7),
            max_auto_resume: 3,
            pause_key_ttl: Duration::from_secs(3600),
            lock_duration: Duration::from_secs(60),
            lease_poll_interval: Duration::from_millis(250),
            fetch_batch_size: 500,
            status_buffer_capacity: 1024,
            indicator_window: 64,
        }
    }
}

fn resolve_database_url(provided: Option<String>) -> String {
    if let Some(url) = provided {
        return url;
    }
    dotenvy::dotenv().ok();
    std::env::var("BACKTEST_DATABASE_URL").unwrap_or_else(|_| "sqlite://backtests.db".to_string())
}

impl EngineConfig {
    #[must_use]
    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = resolve_database_url(Some(url.into()));
        self
    }

    #[must_use]
    pub fn with_checkpoint_interval(mut self, steps: u64) -> Self {
        // A zero interval would checkpoint on every modulus hit of 0.
        self.checkpoint_interval = steps.max(1);
        self
    }

    #[must_use]
    pub fn with_max_checkpoint_age(mut self, age: chrono::Duration) -> Self {
        self.max_checkpoint_age = age;
        self
    }

    #[must_use]
    pub fn with_max_auto_resume(mut self, count: u32) -> Self {
        self.max_auto_resume = count;
        self
    }

    #[must_use]
    pub fn with_pause_key_ttl(mut self, ttl: Duration) -> Self {
        self.pause_key_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_lock_duration(mut self, duration: Duration) -> Self {
        self.lock_duration = duration;
        self
    }

    #[must_use]
    pub fn with_lease_poll_interval(mut self, interval: Duration) -> Self {
        self.lease_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_fetch_batch_size(mut self, size: usize) -> Self {
        self.fetch_batch_size = size.max(1);
        self
    }

    #[must_use]
    pub fn with_queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = name.into();
        self
    }
}
