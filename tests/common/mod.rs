#![allow(dead_code)]

pub mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use backtest_core::accounting::AverageCostAccounting;
use backtest_core::algorithm::StaticResolver;
use backtest_core::config::EngineConfig;
use backtest_core::indicators::IndicatorCache;
use backtest_core::kv::InMemoryKv;
use backtest_core::market::InMemoryDataSource;
use backtest_core::model::Backtest;
use backtest_core::queue::{EnqueueOptions, ExecutionQueue, JobPayload};
use backtest_core::recovery::RecoveryService;
use backtest_core::status::{StatusEvent, StatusUpdate};
use backtest_core::store::BacktestStore;
use backtest_core::worker::Worker;
use tokio::sync::broadcast;

pub use fixtures::{
    ALGORITHM, DATASET, FAILING_ALGORITHM, USER, candle_groups, sample_backtest,
};

/// Everything a test needs, wired over a temp SQLite file and an in-memory
/// KV store.
pub struct Harness {
    pub config: EngineConfig,
    pub store: Arc<BacktestStore>,
    pub queue: Arc<ExecutionQueue>,
    pub kv: Arc<InMemoryKv>,
    pub status: Arc<backtest_core::status::StatusStream>,
    pub market: Arc<InMemoryDataSource>,
    pub worker: Worker,
    pub recovery: RecoveryService,
    _dir: tempfile::TempDir,
}

pub async fn harness(total_candles: usize) -> Harness {
    harness_with(total_candles, EngineConfig::default()).await
}

pub async fn harness_with(total_candles: usize, config: EngineConfig) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_url = format!("sqlite://{}", dir.path().join("core.db").display());
    let config = config
        .with_database_url(db_url)
        .with_lease_poll_interval(Duration::from_millis(10));

    let store = Arc::new(
        BacktestStore::connect(&config.database_url)
            .await
            .expect("store connect"),
    );
    let kv = Arc::new(InMemoryKv::new());
    let queue = Arc::new(ExecutionQueue::new(
        store.pool().clone(),
        kv.clone(),
        &config,
    ));
    let status = Arc::new(backtest_core::status::StatusStream::new(
        config.status_buffer_capacity,
    ));
    let market = Arc::new(InMemoryDataSource::new());
    market.insert_dataset(DATASET, candle_groups(total_candles));

    let resolver = Arc::new(
        StaticResolver::new()
            .with_algorithm(ALGORITHM, Arc::new(fixtures::ThresholdAlgorithm))
            .with_algorithm(FAILING_ALGORITHM, Arc::new(fixtures::ExplodingAlgorithm)),
    );
    let worker = Worker::new(
        store.clone(),
        queue.clone(),
        kv.clone(),
        status.clone(),
        market.clone(),
        resolver,
        Arc::new(AverageCostAccounting),
        Arc::new(IndicatorCache::disabled()),
        config.clone(),
    );
    let recovery = RecoveryService::new(
        store.clone(),
        queue.clone(),
        kv.clone(),
        status.clone(),
        config.clone(),
    );

    Harness {
        config,
        store,
        queue,
        kv,
        status,
        market,
        worker,
        recovery,
        _dir: dir,
    }
}

impl Harness {
    /// The lock key the queue uses for one job id.
    pub fn lock_key(&self, job_id: &str) -> String {
        format!(
            "{}:{}:{}:lock",
            self.config.lock_prefix, self.config.queue_name, job_id
        )
    }

    /// Create the record and enqueue its job, the way the API boundary does.
    pub async fn submit(&self, backtest: &Backtest) {
        self.store.create(backtest).await.expect("create backtest");
        self.enqueue(backtest).await;
    }

    /// Enqueue a job for an already-stored record.
    pub async fn enqueue(&self, backtest: &Backtest) {
        self.queue
            .enqueue(&backtest.id, &payload_for(backtest), EnqueueOptions::default())
            .await
            .expect("enqueue");
    }
}

pub fn payload_for(backtest: &Backtest) -> JobPayload {
    JobPayload {
        backtest_id: backtest.id.clone(),
        user_id: backtest.resolved_user_id().unwrap_or(USER).to_string(),
        dataset_id: backtest.resolved_dataset_id().unwrap_or(DATASET).to_string(),
        algorithm_id: backtest
            .resolved_algorithm_id()
            .unwrap_or(ALGORITHM)
            .to_string(),
        deterministic_seed: backtest.seed.clone(),
        mode: backtest.mode,
    }
}

/// Collect every event already buffered on a subscription.
pub fn drain_events(rx: &mut broadcast::Receiver<StatusUpdate>) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Ok(update) = rx.try_recv() {
        events.push(update.event);
    }
    events
}
