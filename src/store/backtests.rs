//! Backtest record CRUD and guarded status transitions.

use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use tracing::instrument;

use super::{BacktestStore, StoreError, serde_err};
use crate::checkpoint::CheckpointState;
use crate::model::{Backtest, ConfigSnapshot};
use crate::types::{BacktestMode, BacktestStatus};

pub(crate) fn parse_rfc3339(value: &str, field: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            message: format!("{field}: bad timestamp `{value}`: {e}"),
        })
}

fn row_to_backtest(row: &SqliteRow) -> Result<Backtest, StoreError> {
    let status_raw: String = row.try_get("status")?;
    let status = BacktestStatus::decode(&status_raw).ok_or_else(|| StoreError::Corrupt {
        message: format!("status: unknown value `{status_raw}`"),
    })?;
    let mode_raw: String = row.try_get("mode")?;
    let mode = BacktestMode::decode(&mode_raw).ok_or_else(|| StoreError::Corrupt {
        message: format!("mode: unknown value `{mode_raw}`"),
    })?;

    let config_json: String = row.try_get("config_json")?;
    let config: ConfigSnapshot = serde_json::from_str(&config_json).map_err(serde_err)?;

    let checkpoint_json: Option<String> = row.try_get("checkpoint_json")?;
    let checkpoint: Option<CheckpointState> = checkpoint_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()
        .map_err(serde_err)?;

    let last_checkpoint_at: Option<String> = row.try_get("last_checkpoint_at")?;
    let last_checkpoint_at = last_checkpoint_at
        .as_deref()
        .map(|s| parse_rfc3339(s, "last_checkpoint_at"))
        .transpose()?;

    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    let processed_count: i64 = row.try_get("processed_count")?;
    let total_count: i64 = row.try_get("total_count")?;

    Ok(Backtest {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        dataset_id: row.try_get("dataset_id")?,
        algorithm_id: row.try_get("algorithm_id")?,
        mode,
        status,
        seed: row.try_get("seed")?,
        config,
        processed_count: processed_count.max(0) as u64,
        total_count: total_count.max(0) as u64,
        checkpoint,
        last_checkpoint_at,
        error_message: row.try_get("error_message")?,
        created_at: parse_rfc3339(&created_at, "created_at")?,
        updated_at: parse_rfc3339(&updated_at, "updated_at")?,
    })
}

impl BacktestStore {
    /// Insert a new record, including any pre-existing checkpoint fields
    /// (the API boundary owns record creation).
    #[instrument(skip(self, backtest), fields(backtest_id = %backtest.id), err)]
    pub async fn create(&self, backtest: &Backtest) -> Result<(), StoreError> {
        let config_json = serde_json::to_string(&backtest.config).map_err(serde_err)?;
        let checkpoint_json = backtest
            .checkpoint
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(serde_err)?;

        sqlx::query(
            r#"
            INSERT INTO backtests
                (id, user_id, dataset_id, algorithm_id, mode, status, seed,
                 config_json, processed_count, total_count, checkpoint_json,
                 last_checkpoint_at, error_message, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&backtest.id)
        .bind(&backtest.user_id)
        .bind(&backtest.dataset_id)
        .bind(&backtest.algorithm_id)
        .bind(backtest.mode.encode())
        .bind(backtest.status.encode())
        .bind(&backtest.seed)
        .bind(config_json)
        .bind(backtest.processed_count as i64)
        .bind(backtest.total_count as i64)
        .bind(checkpoint_json)
        .bind(backtest.last_checkpoint_at.map(|at| at.to_rfc3339()))
        .bind(&backtest.error_message)
        .bind(backtest.created_at.to_rfc3339())
        .bind(backtest.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Backtest>, StoreError> {
        let row = sqlx::query("SELECT * FROM backtests WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_backtest).transpose()
    }

    async fn require(&self, id: &str) -> Result<Backtest, StoreError> {
        self.get(id).await?.ok_or_else(|| StoreError::NotFound {
            id: id.to_string(),
        })
    }

    /// All backtests the recovery sweep must look at: non-terminal statuses.
    pub async fn list_recoverable(&self) -> Result<Vec<Backtest>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM backtests
            WHERE status IN ('PENDING', 'RUNNING', 'PAUSED')
            ORDER BY created_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_backtest).collect()
    }

    /// Guarded status transition. The current status is re-checked in the
    /// UPDATE's WHERE clause so a concurrent writer surfaces as
    /// [`StoreError::InvalidTransition`].
    #[instrument(skip(self), err)]
    pub async fn transition(
        &self,
        id: &str,
        next: BacktestStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let current = self.require(id).await?;
        if !current.status.can_transition_to(next) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: next,
            });
        }
        let updated = sqlx::query(
            r#"
            UPDATE backtests
            SET status = ?, error_message = ?, updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(next.encode())
        .bind(error_message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(current.status.encode())
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: next,
            });
        }
        Ok(())
    }

    /// Atomic checkpoint write: one UPDATE covering status, blob, timestamp,
    /// and processed count.
    #[instrument(skip(self, blob), fields(backtest_id = %id, processed), err)]
    pub async fn write_checkpoint(
        &self,
        id: &str,
        blob: &CheckpointState,
        processed: u64,
    ) -> Result<(), StoreError> {
        let checkpoint_json = serde_json::to_string(blob).map_err(serde_err)?;
        let now = Utc::now().to_rfc3339();
        let updated = sqlx::query(
            r#"
            UPDATE backtests
            SET status = 'RUNNING', checkpoint_json = ?, last_checkpoint_at = ?,
                processed_count = ?, updated_at = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(checkpoint_json)
        .bind(&now)
        .bind(processed as i64)
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                id: id.to_string(),
            });
        }
        Ok(())
    }

    /// Null the checkpoint and zero the processed count (stale or rejected
    /// checkpoint path).
    #[instrument(skip(self), err)]
    pub async fn clear_checkpoint(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE backtests
            SET checkpoint_json = NULL, last_checkpoint_at = NULL,
                processed_count = 0, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal completion: clears the checkpoint and pins the processed
    /// count to the total in the same UPDATE.
    #[instrument(skip(self), err)]
    pub async fn complete(&self, id: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE backtests
            SET status = 'COMPLETED', checkpoint_json = NULL,
                last_checkpoint_at = NULL, processed_count = total_count,
                error_message = NULL, updated_at = ?
            WHERE id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            let current = self.require(id).await?;
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: BacktestStatus::Completed,
            });
        }
        Ok(())
    }

    /// Fail terminally from any non-terminal status.
    #[instrument(skip(self, message), err)]
    pub async fn mark_failed(&self, id: &str, message: &str) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE backtests
            SET status = 'FAILED', error_message = ?, updated_at = ?
            WHERE id = ? AND status IN ('PENDING', 'RUNNING', 'PAUSED')
            "#,
        )
        .bind(message)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            let current = self.require(id).await?;
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: BacktestStatus::Failed,
            });
        }
        Ok(())
    }

    /// Recovery rewrite: back to PENDING with the auto-resume count bumped
    /// inside the config snapshot, optionally dropping the checkpoint. One
    /// UPDATE; this is the DB-first half of the recover-then-enqueue pair.
    #[instrument(skip(self), err)]
    pub async fn requeue_as_pending(
        &self,
        id: &str,
        auto_resume_count: u32,
        keep_checkpoint: bool,
    ) -> Result<(), StoreError> {
        let current = self.require(id).await?;
        if !current.status.can_transition_to(BacktestStatus::Pending) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: current.status,
                to: BacktestStatus::Pending,
            });
        }
        let mut config = current.config.clone();
        config.auto_resume_count = auto_resume_count;
        let config_json = serde_json::to_string(&config).map_err(serde_err)?;
        let now = Utc::now().to_rfc3339();

        let query = if keep_checkpoint {
            sqlx::query(
                r#"
                UPDATE backtests
                SET status = 'PENDING', config_json = ?, error_message = NULL,
                    updated_at = ?
                WHERE id = ?
                "#,
            )
        } else {
            sqlx::query(
                r#"
                UPDATE backtests
                SET status = 'PENDING', config_json = ?, error_message = NULL,
                    checkpoint_json = NULL, last_checkpoint_at = NULL,
                    processed_count = 0, updated_at = ?
                WHERE id = ?
                "#,
            )
        };
        query
            .bind(config_json)
            .bind(&now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Record the dataset length once the worker has resolved it.
    pub async fn update_total(&self, id: &str, total: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE backtests SET total_count = ?, updated_at = ? WHERE id = ?")
            .bind(total as i64)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
