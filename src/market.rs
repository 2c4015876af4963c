//! Market-data collaborator interface.
//!
//! The execution core consumes ordered OHLC candles from a
//! [`MarketDataSource`]; the production implementation sits in front of the
//! dataset service, while [`InMemoryDataSource`] backs tests and local runs.
//! Candles arrive grouped per timestamp: one simulation step sees every asset
//! quoted at that instant.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One OHLC observation for one asset at one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub asset_id: String,
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// What the algorithm sees at one step: the closing prices of every asset
/// quoted at this timestamp, plus any requested indicator values keyed by
/// fingerprint.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub timestamp: DateTime<Utc>,
    pub prices: FxHashMap<String, f64>,
    pub indicators: FxHashMap<String, f64>,
}

impl MarketSnapshot {
    /// Build a snapshot from the candles of one timestamp.
    #[must_use]
    pub fn from_candles(timestamp: DateTime<Utc>, candles: &[Candle]) -> Self {
        let mut prices = FxHashMap::default();
        for candle in candles {
            prices.insert(candle.asset_id.clone(), candle.close);
        }
        Self {
            timestamp,
            prices,
            indicators: FxHashMap::default(),
        }
    }

    #[must_use]
    pub fn price(&self, asset_id: &str) -> Option<f64> {
        self.prices.get(asset_id).copied()
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum MarketDataError {
    #[error("dataset not found: {dataset_id}")]
    #[diagnostic(
        code(backtest::market::dataset_not_found),
        help("Verify the dataset id `{dataset_id}` exists in the market-data service.")
    )]
    DatasetNotFound { dataset_id: String },

    #[error("requested range {start}..{end} outside dataset of {len} timestamps")]
    #[diagnostic(code(backtest::market::range))]
    RangeOutOfBounds { start: usize, end: usize, len: usize },

    #[error("market data backend error: {message}")]
    #[diagnostic(code(backtest::market::backend))]
    Backend { message: String },
}

/// Source of ordered historical candles.
///
/// Implementations must yield timestamps in strictly increasing order and
/// return the same sequence on every call for a given dataset id; the
/// checkpoint format verifies timestamps against this sequence on restore.
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// The ordered, distinct timestamps of a dataset.
    async fn timestamps(&self, dataset_id: &str) -> Result<Vec<DateTime<Utc>>, MarketDataError>;

    /// Candle groups for the index range `[start, end)`, one group per
    /// timestamp, in timestamp order.
    async fn fetch_range(
        &self,
        dataset_id: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<Vec<Candle>>, MarketDataError>;
}

/// Process-local candle store for tests and local development.
#[derive(Default)]
pub struct InMemoryDataSource {
    datasets: RwLock<FxHashMap<String, Vec<Vec<Candle>>>>,
}

impl InMemoryDataSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset as candle groups, one group per timestamp.
    /// Groups must already be in increasing timestamp order.
    pub fn insert_dataset(&self, dataset_id: impl Into<String>, groups: Vec<Vec<Candle>>) {
        self.datasets.write().insert(dataset_id.into(), groups);
    }
}

#[async_trait]
impl MarketDataSource for InMemoryDataSource {
    async fn timestamps(&self, dataset_id: &str) -> Result<Vec<DateTime<Utc>>, MarketDataError> {
        let datasets = self.datasets.read();
        let groups = datasets
            .get(dataset_id)
            .ok_or_else(|| MarketDataError::DatasetNotFound {
                dataset_id: dataset_id.to_string(),
            })?;
        Ok(groups
            .iter()
            .filter_map(|group| group.first().map(|c| c.timestamp))
            .collect())
    }

    async fn fetch_range(
        &self,
        dataset_id: &str,
        start: usize,
        end: usize,
    ) -> Result<Vec<Vec<Candle>>, MarketDataError> {
        let datasets = self.datasets.read();
        let groups = datasets
            .get(dataset_id)
            .ok_or_else(|| MarketDataError::DatasetNotFound {
                dataset_id: dataset_id.to_string(),
            })?;
        if start > end || end > groups.len() {
            return Err(MarketDataError::RangeOutOfBounds {
                start,
                end,
                len: groups.len(),
            });
        }
        Ok(groups[start..end].to_vec())
    }
}
