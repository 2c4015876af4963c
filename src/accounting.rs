//! Order/fill accounting collaborator interface.
//!
//! The production accounting engine handles order types, fees, and slippage
//! models; the core only needs signals applied to the portfolio shape the
//! checkpoint carries. [`AverageCostAccounting`] implements exactly that
//! much: market execution at the snapshot close with average-cost position
//! tracking.

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::algorithm::{SignalAction, TradingSignal};
use crate::market::MarketSnapshot;
use crate::model::Portfolio;

/// An executed trade row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub asset_id: String,
    pub side: SignalAction,
    pub quantity: f64,
    pub price: f64,
    pub executed_at: DateTime<Utc>,
}

/// A fill row; one per executed signal here, the production engine may split.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fill {
    pub asset_id: String,
    pub quantity: f64,
    pub price: f64,
    pub filled_at: DateTime<Utc>,
}

/// Rows produced by applying one step's signals.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub trades: Vec<Trade>,
    pub fills: Vec<Fill>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum AccountingError {
    #[error("no price for asset {asset_id} at {timestamp}")]
    #[diagnostic(code(backtest::accounting::no_price))]
    MissingPrice {
        asset_id: String,
        timestamp: DateTime<Utc>,
    },

    #[error("invalid signal quantity {quantity} for asset {asset_id}")]
    #[diagnostic(code(backtest::accounting::quantity))]
    InvalidQuantity { asset_id: String, quantity: f64 },
}

/// Applies signals to the portfolio.
///
/// Applying is pure arithmetic; it is not one of the worker loop's suspension
/// points, so the trait is synchronous.
pub trait AccountingEngine: Send + Sync {
    fn apply(
        &self,
        portfolio: &mut Portfolio,
        signals: &[TradingSignal],
        snapshot: &MarketSnapshot,
    ) -> Result<StepOutcome, AccountingError>;
}

/// Minimal engine: fills at the snapshot close, average-cost positions,
/// buys bounded by cash, sells bounded by holdings. Signals that cannot
/// execute (no cash, nothing held) are dropped rather than erroring; the
/// production engine reports them as rejected orders.
#[derive(Debug, Default, Clone, Copy)]
pub struct AverageCostAccounting;

impl AccountingEngine for AverageCostAccounting {
    fn apply(
        &self,
        portfolio: &mut Portfolio,
        signals: &[TradingSignal],
        snapshot: &MarketSnapshot,
    ) -> Result<StepOutcome, AccountingError> {
        let mut outcome = StepOutcome::default();

        for signal in signals {
            if !(signal.quantity.is_finite() && signal.quantity > 0.0) {
                return Err(AccountingError::InvalidQuantity {
                    asset_id: signal.asset_id.clone(),
                    quantity: signal.quantity,
                });
            }
            let price = snapshot.price(&signal.asset_id).ok_or_else(|| {
                AccountingError::MissingPrice {
                    asset_id: signal.asset_id.clone(),
                    timestamp: snapshot.timestamp,
                }
            })?;

            let executed = match signal.action {
                SignalAction::Buy => {
                    let affordable = portfolio.cash_balance / price;
                    let quantity = signal.quantity.min(affordable);
                    if quantity <= 0.0 {
                        continue;
                    }
                    let position = portfolio.position_mut(&signal.asset_id);
                    let held_cost = position.quantity * position.average_cost;
                    position.quantity += quantity;
                    position.average_cost = (held_cost + quantity * price) / position.quantity;
                    portfolio.cash_balance -= quantity * price;
                    quantity
                }
                SignalAction::Sell => {
                    let held = portfolio
                        .position(&signal.asset_id)
                        .map(|p| p.quantity)
                        .unwrap_or(0.0);
                    let quantity = signal.quantity.min(held);
                    if quantity <= 0.0 {
                        continue;
                    }
                    portfolio.position_mut(&signal.asset_id).quantity -= quantity;
                    portfolio.cash_balance += quantity * price;
                    quantity
                }
            };

            outcome.trades.push(Trade {
                asset_id: signal.asset_id.clone(),
                side: signal.action,
                quantity: executed,
                price,
                executed_at: snapshot.timestamp,
            });
            outcome.fills.push(Fill {
                asset_id: signal.asset_id.clone(),
                quantity: executed,
                price,
                filled_at: snapshot.timestamp,
            });
        }

        portfolio.prune_flat();
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashMap;

    fn snapshot_with(asset: &str, price: f64) -> MarketSnapshot {
        let mut prices = FxHashMap::default();
        prices.insert(asset.to_string(), price);
        MarketSnapshot {
            timestamp: Utc::now(),
            prices,
            indicators: FxHashMap::default(),
        }
    }

    fn buy(asset: &str, quantity: f64) -> TradingSignal {
        TradingSignal {
            asset_id: asset.into(),
            action: SignalAction::Buy,
            quantity,
        }
    }

    fn sell(asset: &str, quantity: f64) -> TradingSignal {
        TradingSignal {
            asset_id: asset.into(),
            action: SignalAction::Sell,
            quantity,
        }
    }

    #[test]
    fn buy_then_sell_round_trips_cash() {
        let engine = AverageCostAccounting;
        let mut portfolio = Portfolio::with_cash(1_000.0);
        let snapshot = snapshot_with("BTC", 100.0);

        let outcome = engine
            .apply(&mut portfolio, &[buy("BTC", 4.0)], &snapshot)
            .unwrap();
        assert_eq!(outcome.trades.len(), 1);
        assert_eq!(portfolio.cash_balance, 600.0);
        assert_eq!(portfolio.position("BTC").unwrap().quantity, 4.0);
        assert_eq!(portfolio.position("BTC").unwrap().average_cost, 100.0);

        engine
            .apply(&mut portfolio, &[sell("BTC", 4.0)], &snapshot)
            .unwrap();
        assert_eq!(portfolio.cash_balance, 1_000.0);
        assert!(portfolio.position("BTC").is_none());
    }

    #[test]
    fn buys_are_bounded_by_cash() {
        let engine = AverageCostAccounting;
        let mut portfolio = Portfolio::with_cash(50.0);
        let snapshot = snapshot_with("BTC", 100.0);

        let outcome = engine
            .apply(&mut portfolio, &[buy("BTC", 3.0)], &snapshot)
            .unwrap();
        assert_eq!(outcome.trades[0].quantity, 0.5);
        assert_eq!(portfolio.cash_balance, 0.0);
    }

    #[test]
    fn sells_without_holdings_are_dropped() {
        let engine = AverageCostAccounting;
        let mut portfolio = Portfolio::with_cash(100.0);
        let snapshot = snapshot_with("BTC", 10.0);

        let outcome = engine
            .apply(&mut portfolio, &[sell("BTC", 1.0)], &snapshot)
            .unwrap();
        assert!(outcome.trades.is_empty());
        assert_eq!(portfolio.cash_balance, 100.0);
    }

    #[test]
    fn missing_price_is_an_error() {
        let engine = AverageCostAccounting;
        let mut portfolio = Portfolio::with_cash(100.0);
        let snapshot = snapshot_with("BTC", 10.0);
        assert!(matches!(
            engine.apply(&mut portfolio, &[buy("ETH", 1.0)], &snapshot),
            Err(AccountingError::MissingPrice { .. })
        ));
    }

    #[test]
    fn average_cost_blends_across_buys() {
        let engine = AverageCostAccounting;
        let mut portfolio = Portfolio::with_cash(10_000.0);

        engine
            .apply(&mut portfolio, &[buy("BTC", 1.0)], &snapshot_with("BTC", 100.0))
            .unwrap();
        engine
            .apply(&mut portfolio, &[buy("BTC", 1.0)], &snapshot_with("BTC", 200.0))
            .unwrap();

        let position = portfolio.position("BTC").unwrap();
        assert_eq!(position.quantity, 2.0);
        assert_eq!(position.average_cost, 150.0);
    }
}
