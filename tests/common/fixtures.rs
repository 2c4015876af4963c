use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use backtest_core::algorithm::{Algorithm, AlgorithmError, SignalAction, TradingSignal};
use backtest_core::market::{Candle, MarketSnapshot};
use backtest_core::model::{Backtest, ConfigSnapshot, Portfolio};
use backtest_core::rng::DeterministicRng;
use backtest_core::types::BacktestMode;

pub const DATASET: &str = "dataset-ohlc-1m";
pub const ALGORITHM: &str = "algo-momentum";
pub const FAILING_ALGORITHM: &str = "algo-explodes";
pub const USER: &str = "user-1";
pub const ASSET: &str = "BTC";

/// Deterministic single-asset candle series: one-minute bars from a fixed
/// epoch, price a pure function of the index.
pub fn candle_groups(total: usize) -> Vec<Vec<Candle>> {
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    (0..total)
        .map(|i| {
            let timestamp = start + chrono::Duration::minutes(i as i64);
            let close = 100.0 + 10.0 * ((i as f64) * 0.07).sin() + (i as f64) * 0.01;
            vec![Candle {
                asset_id: ASSET.into(),
                timestamp,
                open: close - 0.2,
                high: close + 0.5,
                low: close - 0.5,
                close,
                volume: 10.0 + (i % 7) as f64,
            }]
        })
        .collect()
}

/// A fresh record bound to the fixture dataset and algorithm, seeded from
/// its own id.
pub fn sample_backtest(id: &str) -> Backtest {
    Backtest::new(
        id,
        USER,
        DATASET,
        ALGORITHM,
        BacktestMode::Historical,
        format!("seed-{id}"),
        ConfigSnapshot::with_initial_cash(10_000.0),
    )
}

/// Stochastic test strategy: one draw gates the action, a second sizes
/// buys. Two draws on the buy branch makes restored-RNG divergence obvious
/// if a resume ever replays from the wrong state.
pub struct ThresholdAlgorithm;

#[async_trait]
impl Algorithm for ThresholdAlgorithm {
    async fn evaluate(
        &self,
        portfolio: &Portfolio,
        snapshot: &MarketSnapshot,
        rng: &mut DeterministicRng,
    ) -> Result<Vec<TradingSignal>, AlgorithmError> {
        let draw = rng.next_f64();
        let mut signals = Vec::new();
        if draw > 0.62 {
            let size = 0.25 + (rng.next_u64() % 4) as f64 * 0.25;
            signals.push(TradingSignal {
                asset_id: ASSET.into(),
                action: SignalAction::Buy,
                quantity: size,
            });
        } else if draw < 0.20 {
            let held = portfolio.position(ASSET).map(|p| p.quantity).unwrap_or(0.0);
            if held > 0.0 && snapshot.price(ASSET).is_some() {
                signals.push(TradingSignal {
                    asset_id: ASSET.into(),
                    action: SignalAction::Sell,
                    quantity: (held / 2.0).max(0.1),
                });
            }
        }
        Ok(signals)
    }
}

/// Always raises; exercises the terminal-failure path.
pub struct ExplodingAlgorithm;

#[async_trait]
impl Algorithm for ExplodingAlgorithm {
    async fn evaluate(
        &self,
        _portfolio: &Portfolio,
        _snapshot: &MarketSnapshot,
        _rng: &mut DeterministicRng,
    ) -> Result<Vec<TradingSignal>, AlgorithmError> {
        Err(AlgorithmError::Evaluation {
            message: "division by zero in strategy".into(),
        })
    }
}
