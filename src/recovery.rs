//! Boot-time reconciliation of queue state against durable backtest state,
//! plus the public pause/resume entry points.
//!
//! [`RecoveryService::recover_orphaned`] runs once after the store and queue
//! are available and **before** workers open for new leases. It scans for
//! backtests left in non-terminal states, decides per candidate whether to
//! re-queue or fail, and isolates each candidate in its own task so one bad
//! record cannot abort the sweep.
//!
//! The ordering invariant the whole crash-window story rests on: the DB
//! write back to PENDING happens **before** the enqueue. A crash between the
//! two leaves a PENDING backtest with no job — which is exactly the case the
//! next boot's PENDING-skip guard detects and re-queues.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;
use tracing::instrument;

use crate::checkpoint::CheckpointEngine;
use crate::config::EngineConfig;
use crate::kv::{KeyValueStore, KvError};
use crate::model::Backtest;
use crate::pause::{PauseCoordinator, PauseOutcome};
use crate::queue::{EnqueueOptions, ExecutionQueue, JobPayload, QueueError};
use crate::status::{StatusEvent, StatusStream};
use crate::store::{BacktestStore, StoreError};
use crate::types::{BacktestStatus, JobState};

#[derive(Debug, Error, Diagnostic)]
pub enum RecoveryError {
    #[error("backtest not found: {id}")]
    #[diagnostic(code(backtest::recovery::not_found))]
    NotFound { id: String },

    #[error("backtest {id} does not belong to user {user_id}")]
    #[diagnostic(code(backtest::recovery::not_owner))]
    NotOwner { id: String, user_id: String },

    #[error("backtest {id} cannot be resumed from status {status}")]
    #[diagnostic(
        code(backtest::recovery::not_resumable),
        help("Only PAUSED backtests, or COMPLETED ones with unprocessed timestamps, resume.")
    )]
    NotResumable { id: String, status: BacktestStatus },

    #[error(transparent)]
    #[diagnostic(code(backtest::recovery::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(backtest::recovery::queue))]
    Queue(#[from] QueueError),

    #[error(transparent)]
    #[diagnostic(code(backtest::recovery::kv))]
    Kv(#[from] KvError),
}

/// How one candidate fared during the sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RecoveryOutcome {
    Requeued,
    SkippedExistingJob,
    FailedTerminal { reason: String },
}

/// Aggregate outcome of one sweep.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub requeued: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Boot-time reconciliation plus the user-facing pause/resume API.
#[derive(Clone)]
pub struct RecoveryService {
    store: Arc<BacktestStore>,
    queue: Arc<ExecutionQueue>,
    status: Arc<StatusStream>,
    checkpoints: CheckpointEngine,
    pause: PauseCoordinator,
    config: EngineConfig,
}

impl RecoveryService {
    #[must_use]
    pub fn new(
        store: Arc<BacktestStore>,
        queue: Arc<ExecutionQueue>,
        kv: Arc<dyn KeyValueStore>,
        status: Arc<StatusStream>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            status,
            checkpoints: CheckpointEngine::from_config(&config),
            pause: PauseCoordinator::new(kv, config.pause_key_ttl),
            config,
        }
    }

    /// Reconcile every non-terminal backtest against the queue. Idempotent;
    /// safe to call once per boot. Errors from the initial query end the
    /// sweep; per-candidate errors mark that backtest FAILED and the sweep
    /// continues.
    #[instrument(skip(self), err)]
    pub async fn recover_orphaned(&self) -> Result<RecoveryReport, RecoveryError> {
        let candidates = self.store.list_recoverable().await?;
        tracing::info!(count = candidates.len(), "recovery sweep starting");

        let mut handles = Vec::with_capacity(candidates.len());
        for backtest in candidates {
            let service = self.clone();
            let id = backtest.id.clone();
            handles.push((
                id,
                tokio::spawn(async move { service.recover_one(backtest).await }),
            ));
        }

        let mut report = RecoveryReport::default();
        for (id, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(err)) => self.fail_after_recovery_error(&id, &err.to_string()).await,
                Err(join_err) => {
                    self.fail_after_recovery_error(&id, &join_err.to_string())
                        .await
                }
            };
            match outcome {
                RecoveryOutcome::Requeued => report.requeued.push(id),
                RecoveryOutcome::SkippedExistingJob => report.skipped.push(id),
                RecoveryOutcome::FailedTerminal { reason } => report.failed.push((id, reason)),
            }
        }

        tracing::info!(
            requeued = report.requeued.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "recovery sweep finished"
        );
        Ok(report)
    }

    async fn fail_after_recovery_error(&self, id: &str, cause: &str) -> RecoveryOutcome {
        let reason = format!("Recovery failed: {cause}");
        if let Err(err) = self.store.mark_failed(id, &reason).await {
            tracing::error!(backtest_id = %id, error = %err, "could not record recovery failure");
        }
        self.status.emit(
            id,
            StatusEvent::Failed {
                message: reason.clone(),
            },
        );
        RecoveryOutcome::FailedTerminal { reason }
    }

    #[instrument(skip(self, backtest), fields(backtest_id = %backtest.id, status = %backtest.status), err)]
    async fn recover_one(&self, backtest: Backtest) -> Result<RecoveryOutcome, RecoveryError> {
        let id = backtest.id.clone();

        // PENDING-skip guard: a still-queued job is the canonical one. An
        // `active` job after restart means the old worker is dead and its
        // lease is stale — do not skip.
        if backtest.status == BacktestStatus::Pending {
            if let Some(job) = self.queue.get_job(&id).await? {
                if matches!(job.state, JobState::Waiting | JobState::Delayed) {
                    tracing::debug!(backtest_id = %id, "job still queued; skipping");
                    return Ok(RecoveryOutcome::SkippedExistingJob);
                }
            }
        }

        // Retry budget.
        let resume_count = backtest.config.auto_resume_count;
        if resume_count >= self.config.max_auto_resume {
            let reason = format!(
                "exceeded maximum automatic recovery attempts ({} of {})",
                resume_count, self.config.max_auto_resume
            );
            self.store.mark_failed(&id, &reason).await?;
            self.status.emit(
                &id,
                StatusEvent::Failed {
                    message: reason.clone(),
                },
            );
            return Ok(RecoveryOutcome::FailedTerminal { reason });
        }

        // Staleness: a checkpoint too old to trust is cleared here rather
        // than carried into the fresh run.
        let mut checkpoint_index = backtest.checkpoint.as_ref().map(|cp| cp.last_processed_index);
        let mut keep_checkpoint = backtest.checkpoint.is_some();
        if let Some(written_at) = backtest.last_checkpoint_at {
            if keep_checkpoint && self.checkpoints.is_stale(written_at) {
                tracing::info!(backtest_id = %id, "clearing stale checkpoint");
                self.store.clear_checkpoint(&id).await?;
                keep_checkpoint = false;
                checkpoint_index = None;
            }
        }

        // Required relations, with config-snapshot fallback.
        let (Some(user_id), Some(dataset_id), Some(algorithm_id)) = (
            backtest.resolved_user_id(),
            backtest.resolved_dataset_id(),
            backtest.resolved_algorithm_id(),
        ) else {
            let reason = "missing required relations".to_string();
            self.store.mark_failed(&id, &reason).await?;
            self.status.emit(
                &id,
                StatusEvent::Failed {
                    message: reason.clone(),
                },
            );
            return Ok(RecoveryOutcome::FailedTerminal { reason });
        };
        let payload = JobPayload {
            backtest_id: id.clone(),
            user_id: user_id.to_string(),
            dataset_id: dataset_id.to_string(),
            algorithm_id: algorithm_id.to_string(),
            deterministic_seed: backtest.seed.clone(),
            mode: backtest.mode,
        };

        // Any lingering job (including a stale `active` one) goes first.
        self.queue.force_remove(&id).await?;

        // DB-first: PENDING with the bumped auto-resume count must be
        // durable before the job exists.
        self.store
            .requeue_as_pending(&id, resume_count + 1, keep_checkpoint)
            .await?;
        self.queue
            .enqueue(&id, &payload, EnqueueOptions::default())
            .await?;

        self.status.emit(
            &id,
            StatusEvent::Queued {
                resumed: true,
                has_checkpoint: keep_checkpoint,
                checkpoint_index,
            },
        );
        Ok(RecoveryOutcome::Requeued)
    }

    /// User-initiated resume of a paused (or completed-but-incomplete)
    /// backtest. Validates ownership, clears a stale checkpoint, writes
    /// PENDING, then enqueues.
    #[instrument(skip(self), err)]
    pub async fn resume(&self, user_id: &str, backtest_id: &str) -> Result<(), RecoveryError> {
        let backtest =
            self.store
                .get(backtest_id)
                .await?
                .ok_or_else(|| RecoveryError::NotFound {
                    id: backtest_id.to_string(),
                })?;

        if backtest.resolved_user_id() != Some(user_id) {
            return Err(RecoveryError::NotOwner {
                id: backtest_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        let resumable = backtest.status == BacktestStatus::Paused
            || (backtest.status == BacktestStatus::Completed
                && backtest.processed_count < backtest.total_count);
        if !resumable {
            return Err(RecoveryError::NotResumable {
                id: backtest_id.to_string(),
                status: backtest.status,
            });
        }

        let mut checkpoint_index = backtest.checkpoint.as_ref().map(|cp| cp.last_processed_index);
        let mut has_checkpoint = backtest.checkpoint.is_some();
        if let Some(written_at) = backtest.last_checkpoint_at {
            if has_checkpoint && self.checkpoints.is_stale(written_at) {
                self.store.clear_checkpoint(backtest_id).await?;
                has_checkpoint = false;
                checkpoint_index = None;
            }
        }

        let (Some(dataset_id), Some(algorithm_id)) = (
            backtest.resolved_dataset_id(),
            backtest.resolved_algorithm_id(),
        ) else {
            return Err(RecoveryError::NotResumable {
                id: backtest_id.to_string(),
                status: backtest.status,
            });
        };
        let payload = JobPayload {
            backtest_id: backtest_id.to_string(),
            user_id: user_id.to_string(),
            dataset_id: dataset_id.to_string(),
            algorithm_id: algorithm_id.to_string(),
            deterministic_seed: backtest.seed.clone(),
            mode: backtest.mode,
        };

        self.queue.force_remove(backtest_id).await?;
        self.store
            .transition(backtest_id, BacktestStatus::Pending, None)
            .await?;
        self.queue
            .enqueue(backtest_id, &payload, EnqueueOptions::default())
            .await?;

        self.status.emit(
            backtest_id,
            StatusEvent::Queued {
                resumed: true,
                has_checkpoint,
                checkpoint_index,
            },
        );
        Ok(())
    }

    /// Request a cooperative pause; non-throwing `{success, error}` shape.
    pub async fn pause(&self, backtest_id: &str) -> PauseOutcome {
        self.pause.try_set_pause(backtest_id).await
    }

    /// Loud variant for callers that want the KV error raised.
    pub async fn pause_strict(&self, backtest_id: &str) -> Result<(), KvError> {
        self.pause.set_pause(backtest_id).await
    }

    /// Request a hard cancel, observed at the next checkpoint boundary.
    pub async fn cancel(&self, backtest_id: &str) -> Result<(), KvError> {
        self.pause.request_cancel(backtest_id).await
    }
}
