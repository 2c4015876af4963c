//! Append-only result sequences: signals, trades, fills, portfolio
//! snapshots.
//!
//! Every row carries `(backtest_id, seq)`; one step's rows are appended in a
//! single transaction so a crash never leaves a half-written step. The
//! checkpoint records the counts at its boundary, and the restore path
//! truncates each sequence back to those counts before resuming.

use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use super::backtests::parse_rfc3339;
use super::{BacktestStore, StoreError};
use crate::accounting::{Fill, StepOutcome, Trade};
use crate::algorithm::{SignalAction, TradingSignal};
use crate::model::ResultCounts;

/// A persisted portfolio snapshot row (one per checkpoint boundary).
#[derive(Debug, Clone, PartialEq)]
pub struct PortfolioSnapshotRow {
    pub cash_balance: f64,
    pub total_value: f64,
    pub taken_at: DateTime<Utc>,
}

impl BacktestStore {
    /// Append one step's rows, numbering from `base`. Returns the counts
    /// after the append. All rows commit or none do.
    #[instrument(skip_all, fields(backtest_id = %id), err)]
    pub async fn append_step_results(
        &self,
        id: &str,
        base: &ResultCounts,
        signals: &[TradingSignal],
        outcome: &StepOutcome,
        at: DateTime<Utc>,
        snapshot: Option<&PortfolioSnapshotRow>,
    ) -> Result<ResultCounts, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut counts = *base;

        for signal in signals {
            sqlx::query(
                "INSERT INTO signals (backtest_id, seq, asset_id, action, quantity, at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(counts.signals as i64)
            .bind(&signal.asset_id)
            .bind(signal.action.encode())
            .bind(signal.quantity)
            .bind(at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            counts.signals += 1;
        }

        for trade in &outcome.trades {
            sqlx::query(
                "INSERT INTO trades (backtest_id, seq, asset_id, side, quantity, price, executed_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(counts.trades as i64)
            .bind(&trade.asset_id)
            .bind(trade.side.encode())
            .bind(trade.quantity)
            .bind(trade.price)
            .bind(trade.executed_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            counts.trades += 1;
        }

        for fill in &outcome.fills {
            sqlx::query(
                "INSERT INTO fills (backtest_id, seq, asset_id, quantity, price, filled_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(counts.fills as i64)
            .bind(&fill.asset_id)
            .bind(fill.quantity)
            .bind(fill.price)
            .bind(fill.filled_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            counts.fills += 1;
        }

        if let Some(snapshot) = snapshot {
            sqlx::query(
                "INSERT INTO portfolio_snapshots (backtest_id, seq, cash_balance, total_value, taken_at)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(id)
            .bind(counts.snapshots as i64)
            .bind(snapshot.cash_balance)
            .bind(snapshot.total_value)
            .bind(snapshot.taken_at.to_rfc3339())
            .execute(&mut *tx)
            .await?;
            counts.snapshots += 1;
        }

        tx.commit().await?;
        Ok(counts)
    }

    /// Current durable row counts for a backtest.
    pub async fn result_counts(&self, id: &str) -> Result<ResultCounts, StoreError> {
        let count = |table: &str| {
            let sql = format!("SELECT COUNT(*) AS n FROM {table} WHERE backtest_id = ?");
            let pool = self.pool.clone();
            let id = id.to_string();
            async move {
                let row = sqlx::query(&sql).bind(&id).fetch_one(&pool).await?;
                let n: i64 = row.try_get("n")?;
                Ok::<u64, StoreError>(n.max(0) as u64)
            }
        };
        Ok(ResultCounts {
            signals: count("signals").await?,
            trades: count("trades").await?,
            fills: count("fills").await?,
            snapshots: count("portfolio_snapshots").await?,
        })
    }

    /// Delete rows beyond the given counts. Run before resuming from a
    /// checkpoint so replayed steps do not duplicate their tails.
    #[instrument(skip(self, counts), fields(backtest_id = %id), err)]
    pub async fn truncate_results_beyond(
        &self,
        id: &str,
        counts: &ResultCounts,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for (table, keep) in [
            ("signals", counts.signals),
            ("trades", counts.trades),
            ("fills", counts.fills),
            ("portfolio_snapshots", counts.snapshots),
        ] {
            let sql = format!("DELETE FROM {table} WHERE backtest_id = ? AND seq >= ?");
            sqlx::query(&sql)
                .bind(id)
                .bind(keep as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// All trades of a backtest in sequence order.
    pub async fn list_trades(&self, id: &str) -> Result<Vec<Trade>, StoreError> {
        let rows = sqlx::query(
            "SELECT asset_id, side, quantity, price, executed_at
             FROM trades WHERE backtest_id = ? ORDER BY seq",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let side_raw: String = row.try_get("side")?;
                let side = SignalAction::decode(&side_raw).ok_or_else(|| StoreError::Corrupt {
                    message: format!("side: unknown value `{side_raw}`"),
                })?;
                let executed_at: String = row.try_get("executed_at")?;
                Ok(Trade {
                    asset_id: row.try_get("asset_id")?,
                    side,
                    quantity: row.try_get("quantity")?,
                    price: row.try_get("price")?,
                    executed_at: parse_rfc3339(&executed_at, "executed_at")?,
                })
            })
            .collect()
    }

    /// All signals of a backtest in sequence order.
    pub async fn list_signals(&self, id: &str) -> Result<Vec<TradingSignal>, StoreError> {
        let rows = sqlx::query(
            "SELECT asset_id, action, quantity FROM signals
             WHERE backtest_id = ? ORDER BY seq",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let action_raw: String = row.try_get("action")?;
                let action =
                    SignalAction::decode(&action_raw).ok_or_else(|| StoreError::Corrupt {
                        message: format!("action: unknown value `{action_raw}`"),
                    })?;
                Ok(TradingSignal {
                    asset_id: row.try_get("asset_id")?,
                    action,
                    quantity: row.try_get("quantity")?,
                })
            })
            .collect()
    }

    /// All fills of a backtest in sequence order.
    pub async fn list_fills(&self, id: &str) -> Result<Vec<Fill>, StoreError> {
        let rows = sqlx::query(
            "SELECT asset_id, quantity, price, filled_at FROM fills
             WHERE backtest_id = ? ORDER BY seq",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let filled_at: String = row.try_get("filled_at")?;
                Ok(Fill {
                    asset_id: row.try_get("asset_id")?,
                    quantity: row.try_get("quantity")?,
                    price: row.try_get("price")?,
                    filled_at: parse_rfc3339(&filled_at, "filled_at")?,
                })
            })
            .collect()
    }
}
