//! The worker: leases jobs and drives simulations to a terminal state.
//!
//! One worker hosts one job at a time per call; run several workers (or
//! several processes) for parallel backtests. Within a job, candle
//! processing is strictly sequential — step *i* depends on step *i − 1*
//! through the portfolio — and candles are consumed in monotonic timestamp
//! order.
//!
//! The per-job algorithm follows a fixed shape: acquire the record, write
//! RUNNING to durable storage *before* announcing it on the status stream,
//! restore from a verified checkpoint or initialize fresh, then loop over
//! candle batches. Every `checkpoint_interval` steps (and at the terminal
//! step) the worker persists a checkpoint in a single atomic update, renews
//! its lease, and only then consults the pause and cancel flags. Pause
//! latency is therefore bounded by the checkpoint interval.
//!
//! The worker never retries individual candles. An algorithm error or an
//! infrastructure error fails the backtest terminally with the error message
//! on the record; respawns are the recovery sweep's decision, bounded by the
//! auto-resume budget.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::instrument;

use crate::accounting::{AccountingEngine, AccountingError};
use crate::algorithm::{AlgorithmError, AlgorithmResolver};
use crate::checkpoint::{CheckpointEngine, CheckpointError, CheckpointState};
use crate::config::EngineConfig;
use crate::indicators::IndicatorCache;
use crate::kv::KeyValueStore;
use crate::market::{Candle, MarketDataError, MarketDataSource, MarketSnapshot};
use crate::model::{Backtest, Portfolio, ResultCounts};
use crate::pause::PauseCoordinator;
use crate::queue::{ExecutionQueue, JobLease, QueueError};
use crate::rng::DeterministicRng;
use crate::status::{StatusEvent, StatusStream};
use crate::store::{BacktestStore, PortfolioSnapshotRow, StoreError};
use crate::types::BacktestStatus;
use crate::utils::RingBuffer;

#[derive(Debug, Error, Diagnostic)]
pub enum WorkerError {
    #[error("backtest not found for job: {id}")]
    #[diagnostic(code(backtest::worker::missing_backtest))]
    MissingBacktest { id: String },

    #[error("job payload does not match backtest {id}: {detail}")]
    #[diagnostic(
        code(backtest::worker::payload_mismatch),
        help("The job payload is rebuilt from the record at enqueue time; a mismatch means the record changed underneath the queue.")
    )]
    PayloadMismatch { id: String, detail: String },

    #[error(transparent)]
    #[diagnostic(code(backtest::worker::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(backtest::worker::queue))]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(code(backtest::worker::market))]
    Market(#[from] MarketDataError),

    #[error(transparent)]
    #[diagnostic(code(backtest::worker::checkpoint))]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    #[diagnostic(code(backtest::worker::algorithm))]
    Algorithm(#[from] AlgorithmError),

    #[error(transparent)]
    #[diagnostic(code(backtest::worker::accounting))]
    Accounting(#[from] AccountingError),
}

/// How a leased job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOutcome {
    Completed,
    Paused,
    Canceled,
}

/// Long-running job consumer.
pub struct Worker {
    store: Arc<BacktestStore>,
    queue: Arc<ExecutionQueue>,
    checkpoints: CheckpointEngine,
    pause: PauseCoordinator,
    status: Arc<StatusStream>,
    market: Arc<dyn MarketDataSource>,
    algorithms: Arc<dyn AlgorithmResolver>,
    accounting: Arc<dyn AccountingEngine>,
    indicators: Arc<IndicatorCache>,
    config: EngineConfig,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        store: Arc<BacktestStore>,
        queue: Arc<ExecutionQueue>,
        kv: Arc<dyn KeyValueStore>,
        status: Arc<StatusStream>,
        market: Arc<dyn MarketDataSource>,
        algorithms: Arc<dyn AlgorithmResolver>,
        accounting: Arc<dyn AccountingEngine>,
        indicators: Arc<IndicatorCache>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            checkpoints: CheckpointEngine::from_config(&config),
            pause: PauseCoordinator::new(kv, config.pause_key_ttl),
            status,
            market,
            algorithms,
            accounting,
            indicators,
            config,
        }
    }

    /// Consume jobs forever. Queue errors while leasing propagate; job-level
    /// failures are recorded on the backtest and do not stop the loop.
    pub async fn run(&self) -> Result<(), WorkerError> {
        loop {
            let lease = self.queue.lease().await?;
            self.execute(lease).await?;
        }
    }

    /// Process jobs until the queue has nothing waiting. Returns how many
    /// jobs were processed; used by tests and drain-style deployments.
    pub async fn drain(&self) -> Result<u32, WorkerError> {
        let mut processed = 0;
        while let Some(lease) = self.queue.try_lease().await? {
            self.execute(lease).await?;
            processed += 1;
        }
        Ok(processed)
    }

    /// Run one leased job to an outcome. The lease release path always runs:
    /// completion, pause, and cancel all finish the job; failures mark the
    /// backtest FAILED and retain the job row for forensics.
    #[instrument(skip(self, lease), fields(backtest_id = %lease.job().payload.backtest_id), err)]
    async fn execute(&self, lease: JobLease) -> Result<(), WorkerError> {
        let backtest_id = lease.job().payload.backtest_id.clone();
        match self.run_backtest(&lease).await {
            Ok(outcome) => {
                tracing::info!(backtest_id = %backtest_id, ?outcome, "job finished");
                lease.complete().await?;
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(backtest_id = %backtest_id, error = %message, "job failed");
                if let Err(store_err) = self.store.mark_failed(&backtest_id, &message).await {
                    tracing::error!(
                        backtest_id = %backtest_id,
                        error = %store_err,
                        "failed to record failure"
                    );
                }
                self.status
                    .emit(&backtest_id, StatusEvent::Failed { message: message.clone() });
                lease.fail(Some(&message)).await?;
                Ok(())
            }
        }
    }

    async fn run_backtest(&self, lease: &JobLease) -> Result<RunOutcome, WorkerError> {
        let payload = &lease.job().payload;
        let backtest_id = &payload.backtest_id;
        if lease.job().id != *backtest_id {
            return Err(WorkerError::PayloadMismatch {
                id: backtest_id.clone(),
                detail: format!("job id {} != payload backtest id", lease.job().id),
            });
        }

        let backtest = self
            .store
            .get(backtest_id)
            .await?
            .ok_or_else(|| WorkerError::MissingBacktest {
                id: backtest_id.clone(),
            })?;
        if backtest.seed != payload.deterministic_seed {
            return Err(WorkerError::PayloadMismatch {
                id: backtest_id.clone(),
                detail: "deterministic seed diverged from record".into(),
            });
        }
        let dataset_id = backtest
            .resolved_dataset_id()
            .ok_or_else(|| WorkerError::PayloadMismatch {
                id: backtest_id.clone(),
                detail: "record has no dataset".into(),
            })?
            .to_string();
        let algorithm_id = backtest
            .resolved_algorithm_id()
            .ok_or_else(|| WorkerError::PayloadMismatch {
                id: backtest_id.clone(),
                detail: "record has no algorithm".into(),
            })?
            .to_string();

        // DB-first: the durable status flips to RUNNING before anyone hears
        // about it on the stream.
        self.store
            .transition(backtest_id, BacktestStatus::Running, None)
            .await?;
        self.status.emit(backtest_id, StatusEvent::Running);

        let timestamps = self.market.timestamps(&dataset_id).await?;
        let total = timestamps.len() as u64;
        if backtest.total_count != total {
            self.store.update_total(backtest_id, total).await?;
        }

        let algorithm = self.algorithms.resolve(&algorithm_id).await?;
        let mut sim = self
            .init_simulation(&backtest, &timestamps)
            .await?;

        let mut history: FxHashMap<String, RingBuffer<Candle>> = FxHashMap::default();
        if sim.start_index > 0 && !backtest.config.indicators.is_empty() {
            self.refill_history(&dataset_id, sim.start_index, &mut history)
                .await?;
        }

        let mut batch: Vec<Vec<Candle>> = Vec::new();
        let mut batch_base = sim.start_index as usize;
        let mut batch_cursor = 0usize;

        for index in sim.start_index..total {
            if batch_cursor >= batch.len() {
                let start = batch_base + batch.len();
                let end = (start + self.config.fetch_batch_size).min(total as usize);
                batch = self.market.fetch_range(&dataset_id, start, end).await?;
                batch_base = start;
                batch_cursor = 0;
            }
            let candles = &batch[batch_cursor];
            batch_cursor += 1;

            let timestamp = timestamps[index as usize];
            let mut snapshot = MarketSnapshot::from_candles(timestamp, candles);
            self.extend_history(&backtest, candles, &mut history, &mut snapshot);

            let signals = algorithm
                .evaluate(&sim.portfolio, &snapshot, &mut sim.rng)
                .await?;
            let outcome = self
                .accounting
                .apply(&mut sim.portfolio, &signals, &snapshot)?;

            let value = sim.portfolio.total_value(&snapshot.prices);
            if value > sim.peak_value {
                sim.peak_value = value;
            }
            if sim.peak_value > 0.0 {
                let drawdown = (sim.peak_value - value) / sim.peak_value;
                if drawdown > sim.max_drawdown {
                    sim.max_drawdown = drawdown;
                }
            }

            let step = index + 1;
            let terminal = step == total;
            let boundary = step % self.config.checkpoint_interval == 0 || terminal;

            let snapshot_row = boundary.then(|| PortfolioSnapshotRow {
                cash_balance: sim.portfolio.cash_balance,
                total_value: value,
                taken_at: timestamp,
            });
            sim.counts = self
                .store
                .append_step_results(
                    backtest_id,
                    &sim.counts,
                    &signals,
                    &outcome,
                    timestamp,
                    snapshot_row.as_ref(),
                )
                .await?;

            if boundary {
                let blob = self.checkpoints.build(CheckpointState {
                    last_processed_index: index,
                    last_processed_timestamp: timestamp,
                    portfolio: sim.portfolio.clone(),
                    peak_value: sim.peak_value,
                    max_drawdown: sim.max_drawdown,
                    rng_state: sim.rng.state(),
                    persisted_counts: sim.counts,
                    checksum: String::new(),
                })?;
                self.store
                    .write_checkpoint(backtest_id, &blob, step)
                    .await?;
                self.status.emit(
                    backtest_id,
                    StatusEvent::Progress {
                        fraction: step as f64 / total as f64,
                        index,
                    },
                );
                if let Err(err) = lease.renew().await {
                    tracing::warn!(backtest_id = %backtest_id, error = %err, "lease renewal failed");
                }

                if !terminal {
                    if self.pause.is_cancel_requested(backtest_id).await {
                        self.pause.clear_cancel(backtest_id).await;
                        self.store
                            .transition(backtest_id, BacktestStatus::Canceled, None)
                            .await?;
                        return Ok(RunOutcome::Canceled);
                    }
                    if self.pause.is_pause_requested(backtest_id).await {
                        self.pause.clear_pause(backtest_id).await;
                        self.store
                            .transition(backtest_id, BacktestStatus::Paused, None)
                            .await?;
                        self.status.emit(backtest_id, StatusEvent::Paused);
                        return Ok(RunOutcome::Paused);
                    }
                }
            }
        }

        self.store.complete(backtest_id).await?;
        self.status.emit(backtest_id, StatusEvent::Completed);
        Ok(RunOutcome::Completed)
    }

    /// Restore simulation state from a verified checkpoint, or initialize
    /// fresh. A stale or rejected checkpoint is cleared — it never fails the
    /// backtest.
    async fn init_simulation(
        &self,
        backtest: &Backtest,
        timestamps: &[DateTime<Utc>],
    ) -> Result<Simulation, WorkerError> {
        if let (Some(blob), Some(written_at)) = (&backtest.checkpoint, backtest.last_checkpoint_at)
        {
            if self.checkpoints.is_stale(written_at) {
                tracing::warn!(backtest_id = %backtest.id, "checkpoint stale; starting fresh");
                self.store.clear_checkpoint(&backtest.id).await?;
            } else {
                match self.checkpoints.validate(blob, timestamps) {
                    Ok(()) => {
                        let restored = self.checkpoints.restore(blob);
                        // Drop any result tail persisted after the checkpoint.
                        self.store
                            .truncate_results_beyond(&backtest.id, &restored.counts)
                            .await?;
                        return Ok(Simulation {
                            portfolio: restored.portfolio,
                            rng: restored.rng,
                            counts: restored.counts,
                            peak_value: restored.peak_value,
                            max_drawdown: restored.max_drawdown,
                            start_index: restored.resume_index,
                        });
                    }
                    Err(rejection) => {
                        tracing::warn!(
                            backtest_id = %backtest.id,
                            reason = %rejection,
                            "checkpoint rejected; starting fresh"
                        );
                        self.store.clear_checkpoint(&backtest.id).await?;
                    }
                }
            }
        }

        self.store
            .truncate_results_beyond(&backtest.id, &ResultCounts::default())
            .await?;
        Ok(Simulation {
            portfolio: Portfolio::with_cash(backtest.config.initial_cash),
            rng: DeterministicRng::from_seed(&backtest.seed),
            counts: ResultCounts::default(),
            peak_value: backtest.config.initial_cash,
            max_drawdown: 0.0,
            start_index: 0,
        })
    }

    /// Rebuild the rolling history windows with the candles preceding the
    /// resume point so indicator values match an uninterrupted run.
    async fn refill_history(
        &self,
        dataset_id: &str,
        resume_index: u64,
        history: &mut FxHashMap<String, RingBuffer<Candle>>,
    ) -> Result<(), WorkerError> {
        let window = self.config.indicator_window as u64;
        let start = resume_index.saturating_sub(window) as usize;
        let groups = self
            .market
            .fetch_range(dataset_id, start, resume_index as usize)
            .await?;
        for group in &groups {
            for candle in group {
                history
                    .entry(candle.asset_id.clone())
                    .or_insert_with(|| RingBuffer::new(self.config.indicator_window))
                    .push(candle.clone());
            }
        }
        Ok(())
    }

    fn extend_history(
        &self,
        backtest: &Backtest,
        candles: &[Candle],
        history: &mut FxHashMap<String, RingBuffer<Candle>>,
        snapshot: &mut MarketSnapshot,
    ) {
        if backtest.config.indicators.is_empty() {
            return;
        }
        for candle in candles {
            history
                .entry(candle.asset_id.clone())
                .or_insert_with(|| RingBuffer::new(self.config.indicator_window))
                .push(candle.clone());
        }
        for kind in &backtest.config.indicators {
            for candle in candles {
                let Some(buffer) = history.get(&candle.asset_id) else {
                    continue;
                };
                let window = buffer.to_vec();
                if let Some(value) =
                    self.indicators
                        .evaluate(kind, &candle.asset_id, snapshot.timestamp, &window)
                {
                    snapshot
                        .indicators
                        .insert(kind.fingerprint(&candle.asset_id), value);
                }
            }
        }
    }
}

/// In-flight simulation state for one job.
struct Simulation {
    portfolio: Portfolio,
    rng: DeterministicRng,
    counts: ResultCounts,
    peak_value: f64,
    max_drawdown: f64,
    start_index: u64,
}
