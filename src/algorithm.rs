//! Algorithm evaluator collaborator interface.
//!
//! The core never interprets an algorithm; it hands the evaluator the current
//! portfolio, the market snapshot, and the deterministic RNG, and applies
//! whatever signals come back. Reproducibility depends on the algorithm using
//! only the injected RNG for stochastic choices.

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::market::MarketSnapshot;
use crate::model::Portfolio;
use crate::rng::DeterministicRng;

/// Direction of a trading signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalAction {
    Buy,
    Sell,
}

impl SignalAction {
    #[must_use]
    pub fn encode(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    #[must_use]
    pub fn decode(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }
}

/// A signal emitted by the algorithm for one asset at one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingSignal {
    pub asset_id: String,
    pub action: SignalAction,
    pub quantity: f64,
}

#[derive(Debug, Error, Diagnostic)]
pub enum AlgorithmError {
    #[error("algorithm not found: {algorithm_id}")]
    #[diagnostic(code(backtest::algorithm::not_found))]
    NotFound { algorithm_id: String },

    /// The user algorithm raised. Terminal for the backtest; the message is
    /// surfaced on the FAILED record.
    #[error("algorithm evaluation failed: {message}")]
    #[diagnostic(code(backtest::algorithm::evaluation))]
    Evaluation { message: String },
}

/// A user-supplied trading algorithm.
#[async_trait]
pub trait Algorithm: Send + Sync {
    /// Evaluate one step. May await indicator computations internally.
    async fn evaluate(
        &self,
        portfolio: &Portfolio,
        snapshot: &MarketSnapshot,
        rng: &mut DeterministicRng,
    ) -> Result<Vec<TradingSignal>, AlgorithmError>;
}

/// Resolves algorithm ids to evaluator instances.
#[async_trait]
pub trait AlgorithmResolver: Send + Sync {
    async fn resolve(&self, algorithm_id: &str) -> Result<Arc<dyn Algorithm>, AlgorithmError>;
}

/// Fixed id-to-algorithm table for tests and embedded deployments.
#[derive(Default)]
pub struct StaticResolver {
    algorithms: FxHashMap<String, Arc<dyn Algorithm>>,
}

impl StaticResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_algorithm(
        mut self,
        algorithm_id: impl Into<String>,
        algorithm: Arc<dyn Algorithm>,
    ) -> Self {
        self.algorithms.insert(algorithm_id.into(), algorithm);
        self
    }
}

#[async_trait]
impl AlgorithmResolver for StaticResolver {
    async fn resolve(&self, algorithm_id: &str) -> Result<Arc<dyn Algorithm>, AlgorithmError> {
        self.algorithms
            .get(algorithm_id)
            .cloned()
            .ok_or_else(|| AlgorithmError::NotFound {
                algorithm_id: algorithm_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl Algorithm for Noop {
        async fn evaluate(
            &self,
            _portfolio: &Portfolio,
            _snapshot: &MarketSnapshot,
            _rng: &mut DeterministicRng,
        ) -> Result<Vec<TradingSignal>, AlgorithmError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn static_resolver_resolves_registered_ids() {
        let resolver = StaticResolver::new().with_algorithm("noop", Arc::new(Noop));
        assert!(resolver.resolve("noop").await.is_ok());
        assert!(matches!(
            resolver.resolve("other").await,
            Err(AlgorithmError::NotFound { .. })
        ));
    }
}
