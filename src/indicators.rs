//! Indicator series requested by algorithms.
//!
//! The calculator variants are a closed sum type rather than a registry of
//! polymorphic instances; the arithmetic itself lives in the external
//! indicator library and is injected as a closure. [`IndicatorCache`]
//! memoizes computed values keyed by fingerprint and timestamp so repeated
//! evaluation over the same window is free, and supports per-variant custom
//! overrides through an injected lookup closure.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::market::Candle;

/// Supported indicator calculators with their frozen parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorKind {
    Sma { period: usize },
    Ema { period: usize },
    Rsi { period: usize },
    StdDev { period: usize },
    Macd { fast: usize, slow: usize, signal: usize },
    BollingerBands { period: usize, width: f64 },
    Atr { period: usize },
}

impl IndicatorKind {
    /// Stable cache key for this calculator applied to one asset.
    ///
    /// Derived series are memoized under this fingerprint; two requests with
    /// the same parameters share one computation.
    #[must_use]
    pub fn fingerprint(&self, asset_id: &str) -> String {
        match self {
            Self::Sma { period } => format!("sma:{period}:{asset_id}"),
            Self::Ema { period } => format!("ema:{period}:{asset_id}"),
            Self::Rsi { period } => format!("rsi:{period}:{asset_id}"),
            Self::StdDev { period } => format!("sd:{period}:{asset_id}"),
            Self::Macd { fast, slow, signal } => {
                format!("macd:{fast}:{slow}:{signal}:{asset_id}")
            }
            Self::BollingerBands { period, width } => {
                format!("bb:{period}:{width}:{asset_id}")
            }
            Self::Atr { period } => format!("atr:{period}:{asset_id}"),
        }
    }

    /// Candles of history this calculator needs before it produces a value.
    #[must_use]
    pub fn warmup(&self) -> usize {
        match self {
            Self::Sma { period }
            | Self::Ema { period }
            | Self::Rsi { period }
            | Self::StdDev { period }
            | Self::Atr { period } => *period,
            Self::Macd { slow, signal, .. } => slow + signal,
            Self::BollingerBands { period, .. } => *period,
        }
    }
}

/// Computes one indicator value over a candle window, newest candle last.
/// Returns `None` while the window is shorter than the warmup.
pub type ComputeFn = Arc<dyn Fn(&IndicatorKind, &[Candle]) -> Option<f64> + Send + Sync>;

/// Resolves a custom calculator for a variant, or `None` for the default.
pub type OverrideLookup = Arc<dyn Fn(&IndicatorKind) -> Option<ComputeFn> + Send + Sync>;

/// Memoizing cache over the injected indicator computation.
pub struct IndicatorCache {
    compute: ComputeFn,
    overrides: Option<OverrideLookup>,
    memo: RwLock<FxHashMap<(String, i64), Option<f64>>>,
}

impl std::fmt::Debug for IndicatorCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndicatorCache")
            .field("memoized", &self.memo.read().len())
            .finish()
    }
}

impl IndicatorCache {
    #[must_use]
    pub fn new(compute: ComputeFn) -> Self {
        Self {
            compute,
            overrides: None,
            memo: RwLock::new(FxHashMap::default()),
        }
    }

    /// A cache that computes nothing; snapshots simply carry no indicator
    /// values. Useful when no external indicator library is wired in.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Arc::new(|_, _| None))
    }

    #[must_use]
    pub fn with_overrides(mut self, lookup: OverrideLookup) -> Self {
        self.overrides = Some(lookup);
        self
    }

    /// Evaluate one calculator for one asset at one timestamp, memoized.
    pub fn evaluate(
        &self,
        kind: &IndicatorKind,
        asset_id: &str,
        timestamp: DateTime<Utc>,
        window: &[Candle],
    ) -> Option<f64> {
        let key = (kind.fingerprint(asset_id), timestamp.timestamp());
        if let Some(value) = self.memo.read().get(&key) {
            return *value;
        }
        let compute = self
            .overrides
            .as_ref()
            .and_then(|lookup| lookup(kind))
            .unwrap_or_else(|| Arc::clone(&self.compute));
        let value = compute(kind, window);
        self.memo.write().insert(key, value);
        value
    }

    /// Drop memoized values (e.g. between backtests sharing a worker).
    pub fn clear(&self) {
        self.memo.write().clear();
    }
}
