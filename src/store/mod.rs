/*!
Durable storage for backtest records and result rows.

This module owns all SQLite I/O for the backtest aggregate: the record
itself (status, config snapshot, checkpoint blob) and the append-only result
sequences (signals, trades, fills, portfolio snapshots). Pure serialization
stays in the model/checkpoint modules; everything here is row mapping and
guarded UPDATEs.

Design points:

- Status transitions are guarded (`UPDATE ... WHERE status = ?`) so an
  out-of-order write surfaces as [`StoreError::InvalidTransition`] instead of
  silently clobbering the state machine.
- The checkpoint write is a single UPDATE covering status, blob, timestamp,
  and processed count, which is what makes a checkpoint atomic.
- Result tables are keyed `(backtest_id, seq)`; crash reconciliation is a
  range delete back to the counts recorded in the last checkpoint.

Timestamps are RFC3339 `TEXT`; JSON blobs are serde-encoded `TEXT`.
*/

mod backtests;
mod results;

pub use results::PortfolioSnapshotRow;

use std::str::FromStr;
use std::time::Duration;

use miette::Diagnostic;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

use crate::types::BacktestStatus;

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("backtest not found: {id}")]
    #[diagnostic(code(backtest::store::not_found))]
    NotFound { id: String },

    #[error("invalid status transition for {id}: {from} -> {to}")]
    #[diagnostic(
        code(backtest::store::invalid_transition),
        help("Only the lease-holding worker (or recovery at boot) may transition a backtest.")
    )]
    InvalidTransition {
        id: String,
        from: BacktestStatus,
        to: BacktestStatus,
    },

    #[error("persisted row is corrupt: {message}")]
    #[diagnostic(
        code(backtest::store::corrupt),
        help("A column holds a value no current enum variant decodes; check migrations.")
    )]
    Corrupt { message: String },

    #[error("JSON serialization failed: {source}")]
    #[diagnostic(code(backtest::store::serde))]
    Serde {
        #[source]
        source: serde_json::Error,
    },

    #[error("storage backend error: {0}")]
    #[diagnostic(
        code(backtest::store::backend),
        help("Ensure the SQLite database URL is valid and accessible.")
    )]
    Backend(#[from] sqlx::Error),
}

pub(crate) fn serde_err(source: serde_json::Error) -> StoreError {
    StoreError::Serde { source }
}

/// SQLite-backed store for the backtest aggregate.
///
/// The pool is shared with the [`ExecutionQueue`](crate::queue::ExecutionQueue)
/// so records and jobs live in one database.
#[derive(Clone)]
pub struct BacktestStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for BacktestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacktestStore").finish()
    }
}

impl BacktestStore {
    /// Connect (or create) a SQLite database at `database_url` and run the
    /// embedded migrations. Example URL: `sqlite://backtests.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        // WAL + busy timeout: the recovery sweep writes from concurrent
        // tasks against the same file.
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StoreError::Backend)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Corrupt {
                message: format!("migration failure: {e}"),
            })?;
        Ok(Self { pool })
    }

    /// The shared connection pool (used by the queue).
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
