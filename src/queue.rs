//! Durable keyed FIFO of backtest execution jobs with worker leases.
//!
//! Job rows live in the same SQLite database as the backtest records; the
//! exclusive lock a worker holds while a job is active lives in the shared KV
//! store under `<prefix>:<queue>:<job_id>:lock`. The job id is the backtest
//! id, so at most one non-terminal job can exist per backtest by primary-key
//! construction.
//!
//! Lease lifecycle: [`ExecutionQueue::lease`] blocks until a waiting job is
//! available and hands back a [`JobLease`]; the worker renews the lock before
//! it expires and finishes with [`JobLease::complete`] or [`JobLease::fail`].
//! If the worker process dies, the lock key expires after the lock duration
//! and the stale `active` row is cleaned up by the recovery sweep via
//! [`ExecutionQueue::force_remove`], which breaks the leftover lock key and
//! retries the removal once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use thiserror::Error;
use tracing::instrument;

use crate::config::EngineConfig;
use crate::kv::{KeyValueStore, KvError};
use crate::types::{BacktestMode, JobState};

/// The single job name this queue carries.
pub const EXECUTE_BACKTEST_JOB: &str = "execute-backtest";

/// Queue message body; stable camelCase wire shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub backtest_id: String,
    pub user_id: String,
    pub dataset_id: String,
    pub algorithm_id: String,
    pub deterministic_seed: String,
    pub mode: BacktestMode,
}

/// Options accepted by [`ExecutionQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueOptions {
    /// Delete the row on successful completion.
    pub remove_on_complete: bool,
    /// How many failed rows to retain for forensics.
    pub remove_on_fail: u32,
    /// Hold the job in `delayed` until this long from now.
    pub delay: Option<Duration>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            remove_on_complete: true,
            remove_on_fail: 50,
            delay: None,
        }
    }
}

/// A queue job record.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum QueueError {
    /// A job with this id already exists in a non-terminal state.
    #[error("job {job_id} already exists in state {state}")]
    #[diagnostic(
        code(backtest::queue::duplicate),
        help("Force-remove the stale job before re-queueing after a crash.")
    )]
    Duplicate { job_id: String, state: JobState },

    /// The job's lock key is held; plain removal refuses to race a worker.
    #[error("job {job_id} is locked by another worker")]
    #[diagnostic(
        code(backtest::queue::locked),
        help("Break a stale lock with force_remove; only recovery should do this.")
    )]
    Locked { job_id: String },

    #[error("job payload serialization failed: {source}")]
    #[diagnostic(code(backtest::queue::serde))]
    Serde {
        #[source]
        source: serde_json::Error,
    },

    #[error("queue row is corrupt: {message}")]
    #[diagnostic(code(backtest::queue::corrupt))]
    Corrupt { message: String },

    #[error(transparent)]
    #[diagnostic(code(backtest::queue::kv))]
    Kv(#[from] KvError),

    #[error("queue backend error: {0}")]
    #[diagnostic(code(backtest::queue::backend))]
    Backend(#[from] sqlx::Error),
}

fn serde_err(source: serde_json::Error) -> QueueError {
    QueueError::Serde { source }
}

/// Durable FIFO keyed by backtest id.
#[derive(Clone)]
pub struct ExecutionQueue {
    pool: SqlitePool,
    kv: Arc<dyn KeyValueStore>,
    name: String,
    lock_prefix: String,
    lock_duration: Duration,
    poll_interval: Duration,
    worker_id: String,
}

impl std::fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("name", &self.name)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl ExecutionQueue {
    /// Build a queue over a shared pool and KV store. Each instance gets its
    /// own worker identity for lock ownership.
    #[must_use]
    pub fn new(pool: SqlitePool, kv: Arc<dyn KeyValueStore>, config: &EngineConfig) -> Self {
        Self {
            pool,
            kv,
            name: config.queue_name.clone(),
            lock_prefix: config.lock_prefix.clone(),
            lock_duration: config.lock_duration,
            poll_interval: config.lease_poll_interval,
            worker_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn lock_key(&self, job_id: &str) -> String {
        format!("{}:{}:{}:lock", self.lock_prefix, self.name, job_id)
    }

    /// Enqueue a job. Fails with [`QueueError::Duplicate`] when a job with
    /// the same id exists in a non-terminal state; a terminal leftover is
    /// replaced. Transient errors surface to the caller — the caller owns
    /// the recovery decision.
    #[instrument(skip(self, payload, opts), err)]
    pub async fn enqueue(
        &self,
        job_id: &str,
        payload: &JobPayload,
        opts: EnqueueOptions,
    ) -> Result<(), QueueError> {
        if let Some(existing) = self.job_state(job_id).await? {
            if existing.is_terminal() {
                sqlx::query("DELETE FROM jobs WHERE id = ?")
                    .bind(job_id)
                    .execute(&self.pool)
                    .await?;
            } else {
                return Err(QueueError::Duplicate {
                    job_id: job_id.to_string(),
                    state: existing,
                });
            }
        }

        let now = Utc::now();
        let (state, run_at) = match opts.delay {
            Some(delay) => {
                let due = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::zero());
                (JobState::Delayed, Some(due.to_rfc3339()))
            }
            None => (JobState::Waiting, None),
        };
        let payload_json = serde_json::to_string(payload).map_err(serde_err)?;

        sqlx::query(
            r#"
            INSERT INTO jobs
                (id, name, payload_json, state, run_at, remove_on_complete,
                 remove_on_fail, enqueued_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(EXECUTE_BACKTEST_JOB)
        .bind(payload_json)
        .bind(state.encode())
        .bind(run_at)
        .bind(opts.remove_on_complete as i64)
        .bind(opts.remove_on_fail as i64)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn job_state(&self, job_id: &str) -> Result<Option<JobState>, QueueError> {
        let row = sqlx::query("SELECT state FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            let raw: String = row.try_get("state")?;
            JobState::decode(&raw).ok_or_else(|| QueueError::Corrupt {
                message: format!("state: unknown value `{raw}`"),
            })
        })
        .transpose()
    }

    /// Observational lookup, used by the recovery sweep.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_job).transpose()
    }

    /// Block until a waiting job can be leased.
    pub async fn lease(&self) -> Result<JobLease, QueueError> {
        loop {
            if let Some(lease) = self.try_lease().await? {
                return Ok(lease);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Attempt to lease the oldest waiting job without blocking.
    ///
    /// Returns `None` when nothing is waiting or another worker holds the
    /// candidate's lock this round.
    #[instrument(skip(self), err)]
    pub async fn try_lease(&self) -> Result<Option<JobLease>, QueueError> {
        self.promote_due_delayed().await?;

        let Some(row) = sqlx::query(
            "SELECT * FROM jobs WHERE state = 'waiting'
             ORDER BY enqueued_at, rowid LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };
        let job = decode_job(&row)?;
        let remove_on_complete: i64 = row.try_get("remove_on_complete")?;
        let remove_on_fail: i64 = row.try_get("remove_on_fail")?;

        let lock_key = self.lock_key(&job.id);
        let acquired = self
            .kv
            .put_if_absent(&lock_key, &self.worker_id, Some(self.lock_duration))
            .await?;
        if !acquired {
            return Ok(None);
        }

        let claimed = sqlx::query(
            "UPDATE jobs SET state = 'active', started_at = ?
             WHERE id = ? AND state = 'waiting'",
        )
        .bind(Utc::now().to_rfc3339())
        .bind(&job.id)
        .execute(&self.pool)
        .await?;
        if claimed.rows_affected() == 0 {
            // Raced; give the lock back.
            self.kv.delete(&lock_key).await?;
            return Ok(None);
        }

        let mut job = job;
        job.state = JobState::Active;
        Ok(Some(JobLease {
            job,
            pool: self.pool.clone(),
            kv: Arc::clone(&self.kv),
            lock_key,
            lock_duration: self.lock_duration,
            worker_id: self.worker_id.clone(),
            remove_on_complete: remove_on_complete != 0,
            remove_on_fail,
        }))
    }

    /// Remove a job record. Refuses with [`QueueError::Locked`] while the
    /// job's lock key is live; missing jobs are a no-op.
    pub async fn remove(&self, job_id: &str) -> Result<(), QueueError> {
        if self.kv.get(&self.lock_key(job_id)).await?.is_some() {
            return Err(QueueError::Locked {
                job_id: job_id.to_string(),
            });
        }
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove a job record regardless of lease state.
    ///
    /// After a restart the old lease is stale but the lock key outlives the
    /// dead process, so the "locked by other worker" failure is handled by
    /// deleting the lock key directly and retrying the removal once.
    #[instrument(skip(self), err)]
    pub async fn force_remove(&self, job_id: &str) -> Result<(), QueueError> {
        match self.remove(job_id).await {
            Ok(()) => Ok(()),
            Err(QueueError::Locked { .. }) => {
                tracing::warn!(job_id, "breaking stale job lock");
                self.kv.delete(&self.lock_key(job_id)).await?;
                self.remove(job_id).await
            }
            Err(other) => Err(other),
        }
    }

    /// Jobs currently occupying their key (non-terminal states).
    pub async fn open_job_count(&self) -> Result<u64, QueueError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs WHERE state IN ('waiting', 'delayed', 'active')",
        )
        .fetch_one(&self.pool)
        .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as u64)
    }

    async fn promote_due_delayed(&self) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE jobs SET state = 'waiting'
             WHERE state = 'delayed' AND run_at IS NOT NULL AND run_at <= ?",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn decode_job(row: &sqlx::sqlite::SqliteRow) -> Result<Job, QueueError> {
    let state_raw: String = row.try_get("state")?;
    let state = JobState::decode(&state_raw).ok_or_else(|| QueueError::Corrupt {
        message: format!("state: unknown value `{state_raw}`"),
    })?;
    let payload_json: String = row.try_get("payload_json")?;
    let payload: JobPayload = serde_json::from_str(&payload_json).map_err(serde_err)?;
    let enqueued_at: String = row.try_get("enqueued_at")?;
    let enqueued_at = DateTime::parse_from_rfc3339(&enqueued_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::Corrupt {
            message: format!("enqueued_at: bad timestamp: {e}"),
        })?;
    Ok(Job {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        payload,
        state,
        enqueued_at,
    })
}

/// Exclusive lease on one active job.
///
/// The release path must always run: finish every lease with
/// [`complete`](Self::complete) or [`fail`](Self::fail). A lease that is
/// merely dropped leaves the row `active` until the lock TTL expires and the
/// recovery sweep cleans it up — that is the crash path, not the normal one.
pub struct JobLease {
    job: Job,
    pool: SqlitePool,
    kv: Arc<dyn KeyValueStore>,
    lock_key: String,
    lock_duration: Duration,
    worker_id: String,
    remove_on_complete: bool,
    remove_on_fail: i64,
}

impl std::fmt::Debug for JobLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLease")
            .field("job_id", &self.job.id)
            .field("worker_id", &self.worker_id)
            .finish()
    }
}

impl JobLease {
    #[must_use]
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Re-arm the lock TTL; call before the lock duration elapses.
    pub async fn renew(&self) -> Result<(), QueueError> {
        self.kv
            .put(&self.lock_key, &self.worker_id, Some(self.lock_duration))
            .await?;
        Ok(())
    }

    /// Finish successfully. Removes the row (or marks it completed when the
    /// job was enqueued with `remove_on_complete = false`) and releases the
    /// lock.
    pub async fn complete(self) -> Result<(), QueueError> {
        if self.remove_on_complete {
            sqlx::query("DELETE FROM jobs WHERE id = ?")
                .bind(&self.job.id)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query(
                "UPDATE jobs SET state = 'completed', finished_at = ? WHERE id = ?",
            )
            .bind(Utc::now().to_rfc3339())
            .bind(&self.job.id)
            .execute(&self.pool)
            .await?;
        }
        self.kv.delete(&self.lock_key).await?;
        Ok(())
    }

    /// Finish with a failure. The row is retained (up to the configured
    /// retention of failed rows per queue) for forensics, then the lock is
    /// released.
    pub async fn fail(self, error_message: Option<&str>) -> Result<(), QueueError> {
        sqlx::query(
            "UPDATE jobs SET state = 'failed', error_message = ?, finished_at = ?
             WHERE id = ?",
        )
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(&self.job.id)
        .execute(&self.pool)
        .await?;

        // Retain only the newest `remove_on_fail` failed rows.
        sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE state = 'failed' AND id NOT IN (
                SELECT id FROM jobs
                WHERE state = 'failed'
                ORDER BY finished_at DESC
                LIMIT ?
            )
            "#,
        )
        .bind(self.remove_on_fail.max(0))
        .execute(&self.pool)
        .await?;

        self.kv.delete(&self.lock_key).await?;
        Ok(())
    }
}
