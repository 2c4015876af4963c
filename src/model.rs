//! Durable domain records: the backtest row, its frozen configuration
//! snapshot, and the portfolio shape carried through checkpoints.
//!
//! Serialized shapes use camelCase field names; these blobs are shared with
//! the API boundary and the checkpoint format, both of which speak camelCase.

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointState;
use crate::types::{BacktestMode, BacktestStatus};

/// A durable backtest record.
///
/// Created by the API boundary; mutated exclusively by the worker holding the
/// job lease, and by the recovery service at boot before workers start.
///
/// Invariants maintained by the store:
/// - status transitions follow [`BacktestStatus::can_transition_to`]
/// - `checkpoint` is `Some` iff `last_checkpoint_at` is `Some`
/// - `processed_count <= total_count`
#[derive(Debug, Clone)]
pub struct Backtest {
    /// Opaque unique identifier; doubles as the queue job id.
    pub id: String,
    /// Owning user. `None` falls back to the config snapshot at recovery.
    pub user_id: Option<String>,
    pub dataset_id: Option<String>,
    pub algorithm_id: Option<String>,
    pub mode: BacktestMode,
    pub status: BacktestStatus,
    /// Deterministic seed; the RNG state in a fresh run derives from this.
    pub seed: String,
    /// Frozen parameters captured at submission.
    pub config: ConfigSnapshot,
    /// Timestamps processed and durably checkpointed so far.
    pub processed_count: u64,
    /// Total timestamps in the dataset.
    pub total_count: u64,
    pub checkpoint: Option<CheckpointState>,
    pub last_checkpoint_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Backtest {
    /// A new record in its initial state, ready for [`BacktestStore::create`].
    ///
    /// [`BacktestStore::create`]: crate::store::BacktestStore::create
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        dataset_id: impl Into<String>,
        algorithm_id: impl Into<String>,
        mode: BacktestMode,
        seed: impl Into<String>,
        config: ConfigSnapshot,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            user_id: Some(user_id.into()),
            dataset_id: Some(dataset_id.into()),
            algorithm_id: Some(algorithm_id.into()),
            mode,
            status: BacktestStatus::Pending,
            seed: seed.into(),
            config,
            processed_count: 0,
            total_count: 0,
            checkpoint: None,
            last_checkpoint_at: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Resolve the owning user, falling back to the config snapshot.
    #[must_use]
    pub fn resolved_user_id(&self) -> Option<&str> {
        self.user_id.as_deref().or(self.config.user_id.as_deref())
    }

    #[must_use]
    pub fn resolved_dataset_id(&self) -> Option<&str> {
        self.dataset_id
            .as_deref()
            .or(self.config.dataset_id.as_deref())
    }

    #[must_use]
    pub fn resolved_algorithm_id(&self) -> Option<&str> {
        self.algorithm_id
            .as_deref()
            .or(self.config.algorithm_id.as_deref())
    }
}

/// Frozen configuration captured when a backtest is submitted.
///
/// The snapshot travels with the record so recovery can rebuild a job payload
/// even when relations were detached, and so the auto-resume budget survives
/// restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigSnapshot {
    /// Starting cash balance for a fresh portfolio.
    pub initial_cash: f64,
    /// Automatic recoveries performed so far; strictly monotonic across
    /// recoveries of the same backtest.
    #[serde(default)]
    pub auto_resume_count: u32,
    /// Indicator series the algorithm wants in each market snapshot.
    #[serde(default)]
    pub indicators: Vec<crate::indicators::IndicatorKind>,
    /// Relation fallbacks, consulted when the record columns are missing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm_id: Option<String>,
    /// Opaque algorithm parameters, frozen at submission.
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ConfigSnapshot {
    #[must_use]
    pub fn with_initial_cash(cash: f64) -> Self {
        Self {
            initial_cash: cash,
            auto_resume_count: 0,
            indicators: Vec::new(),
            user_id: None,
            dataset_id: None,
            algorithm_id: None,
            params: serde_json::Value::Null,
        }
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self::with_initial_cash(10_000.0)
    }
}

/// A single held position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub asset_id: String,
    pub quantity: f64,
    pub average_cost: f64,
}

/// Portfolio snapshot carried through checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Portfolio {
    pub cash_balance: f64,
    pub positions: Vec<Position>,
}

impl Portfolio {
    #[must_use]
    pub fn with_cash(cash: f64) -> Self {
        Self {
            cash_balance: cash,
            positions: Vec::new(),
        }
    }

    #[must_use]
    pub fn position(&self, asset_id: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.asset_id == asset_id)
    }

    /// Mutable access, inserting a flat position on first touch.
    ///
    /// Positions keep their insertion order so that serialized portfolios are
    /// deterministic across runs.
    pub fn position_mut(&mut self, asset_id: &str) -> &mut Position {
        if let Some(idx) = self.positions.iter().position(|p| p.asset_id == asset_id) {
            return &mut self.positions[idx];
        }
        self.positions.push(Position {
            asset_id: asset_id.to_string(),
            quantity: 0.0,
            average_cost: 0.0,
        });
        let last = self.positions.len() - 1;
        &mut self.positions[last]
    }

    /// Drop positions with no quantity left.
    pub fn prune_flat(&mut self) {
        self.positions.retain(|p| p.quantity > 0.0);
    }

    /// Mark-to-market value: cash plus positions at the given prices.
    /// Positions without a quoted price are valued at average cost.
    #[must_use]
    pub fn total_value(&self, prices: &FxHashMap<String, f64>) -> f64 {
        let held: f64 = self
            .positions
            .iter()
            .map(|p| p.quantity * prices.get(&p.asset_id).copied().unwrap_or(p.average_cost))
            .sum();
        self.cash_balance + held
    }
}

/// Counts of result rows already durably persisted.
///
/// Carried in checkpoints to detect under-persisted result tails after a
/// crash; the restore path truncates result sequences back to these counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultCounts {
    pub trades: u64,
    pub signals: u64,
    pub fills: u64,
    pub snapshots: u64,
}
