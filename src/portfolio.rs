//! Portfolio ledger and trade execution.
//!
//! The ledger holds cash and integer share counts that are always a
//! multiple of each asset's lot size. It changes only through
//! [`Portfolio::rebalance`], which executes one independent leg per asset:
//! a leg that cannot trade is skipped and never undoes the others.

use crate::error::{BacktestError, Result};
use crate::types::{EquityPoint, Side, SkipReason, SkippedLeg, TradeRecord};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Configuration for trade execution costs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Commission as a fraction of trade value.
    pub commission_rate: f64,
    /// Minimum commission per executed leg.
    #[serde(default)]
    pub min_commission: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            commission_rate: 0.0003, // 3 bps
            min_commission: 0.0,
        }
    }
}

impl CostModel {
    pub fn new(commission_rate: f64) -> Self {
        Self {
            commission_rate,
            min_commission: 0.0,
        }
    }

    /// Commission for a trade of the given gross value.
    pub fn calculate_commission(&self, trade_value: f64) -> f64 {
        if trade_value <= 0.0 {
            return 0.0;
        }
        (trade_value.abs() * self.commission_rate).max(self.min_commission)
    }
}

/// Outcome of one rebalance call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceReport {
    /// Legs executed by this call, in universe order.
    pub trades: Vec<TradeRecord>,
    /// Legs evaluated without trading.
    pub skipped: Vec<SkippedLeg>,
    /// Commission paid by this call.
    pub commission: f64,
}

impl RebalanceReport {
    pub fn traded(&self) -> bool {
        !self.trades.is_empty()
    }
}

fn is_valid_price(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

/// Cash plus lot-rounded positions, with an append-only trade log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    assets: Vec<String>,
    cash: f64,
    shares: Vec<i64>,
    lot_sizes: Vec<i64>,
    cost_model: CostModel,
    initial_capital: f64,
    trades: Vec<TradeRecord>,
    total_commissions: f64,
    traded_value: f64,
    peak_value: f64,
    equity_curve: Vec<EquityPoint>,
}

impl Portfolio {
    /// A cash-only portfolio over `assets` with one lot size for all.
    pub fn new(assets: Vec<String>, initial_capital: f64, cost_model: CostModel, lot_size: i64) -> Self {
        let n = assets.len();
        Self {
            assets,
            cash: initial_capital,
            shares: vec![0; n],
            lot_sizes: vec![lot_size.max(1); n],
            cost_model,
            initial_capital,
            trades: Vec::new(),
            total_commissions: 0.0,
            traded_value: 0.0,
            peak_value: initial_capital,
            equity_curve: Vec::new(),
        }
    }

    /// Override the lot size of a single asset.
    pub fn set_lot_size(&mut self, asset: &str, lot_size: i64) -> Result<()> {
        let idx = self.index_of(asset)?;
        self.lot_sizes[idx] = lot_size.max(1);
        Ok(())
    }

    fn index_of(&self, asset: &str) -> Result<usize> {
        self.assets
            .iter()
            .position(|a| a == asset)
            .ok_or_else(|| BacktestError::InvalidInput(format!("Unknown asset: {}", asset)))
    }

    pub fn assets(&self) -> &[String] {
        &self.assets
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn shares(&self) -> &[i64] {
        &self.shares
    }

    pub fn lot_sizes(&self) -> &[i64] {
        &self.lot_sizes
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn cost_model(&self) -> &CostModel {
        &self.cost_model
    }

    pub fn trades(&self) -> &[TradeRecord] {
        &self.trades
    }

    pub fn trade_count(&self) -> usize {
        self.trades.len()
    }

    pub fn total_commissions(&self) -> f64 {
        self.total_commissions
    }

    /// Total traded value over initial capital.
    pub fn turnover(&self) -> f64 {
        if self.initial_capital > 0.0 {
            self.traded_value / self.initial_capital
        } else {
            0.0
        }
    }

    pub fn equity_curve(&self) -> &[EquityPoint] {
        &self.equity_curve
    }

    /// Market value of positions. Invalid prices value a position at zero.
    pub fn positions_value(&self, prices: &[f64]) -> f64 {
        self.shares
            .iter()
            .zip(prices)
            .map(|(&s, &p)| if is_valid_price(p) { s as f64 * p } else { 0.0 })
            .sum()
    }

    /// `cash + Σ shares × price`.
    pub fn value(&self, prices: &[f64]) -> f64 {
        self.cash + self.positions_value(prices)
    }

    /// Per-asset market value over total value.
    pub fn weights(&self, prices: &[f64]) -> Vec<f64> {
        let total = self.value(prices);
        if total <= 0.0 {
            return vec![0.0; self.assets.len()];
        }
        self.shares
            .iter()
            .zip(prices)
            .map(|(&s, &p)| if is_valid_price(p) { s as f64 * p / total } else { 0.0 })
            .collect()
    }

    /// Mark to market and append an equity point.
    pub fn record_equity(&mut self, date: NaiveDate, prices: &[f64]) -> EquityPoint {
        let positions_value = self.positions_value(prices);
        let value = self.cash + positions_value;
        self.peak_value = self.peak_value.max(value);

        let drawdown = self.peak_value - value;
        let drawdown_pct = if self.peak_value > 0.0 {
            drawdown / self.peak_value * 100.0
        } else {
            0.0
        };

        let point = EquityPoint {
            date,
            value,
            cash: self.cash,
            positions_value,
            drawdown,
            drawdown_pct,
        };
        self.equity_curve.push(point.clone());
        point
    }

    /// Move holdings towards `target` weights at `prices`.
    ///
    /// Target values are computed once from the value before any leg runs.
    /// Each asset's share delta is rounded to whole lots. Buys beyond
    /// available cash shrink to the lots the cash (net of commission) can
    /// pay for; sells are clipped to the shares held.
    pub fn rebalance(
        &mut self,
        date: NaiveDate,
        target: &[f64],
        prices: &[f64],
        min_trade_value: f64,
    ) -> Result<RebalanceReport> {
        let legs: Vec<usize> = (0..self.assets.len()).collect();
        self.rebalance_assets(date, target, prices, min_trade_value, &legs)
    }

    /// Move only the assets at indices `legs` towards their targets.
    ///
    /// Targets are still sized from the whole portfolio's value. Legs run in
    /// universe order; repeated indices are ignored.
    pub fn rebalance_assets(
        &mut self,
        date: NaiveDate,
        target: &[f64],
        prices: &[f64],
        min_trade_value: f64,
        legs: &[usize],
    ) -> Result<RebalanceReport> {
        let n = self.assets.len();
        if target.len() != n || prices.len() != n {
            return Err(BacktestError::InvalidInput(format!(
                "Expected {} target weights and prices, got {} and {}",
                n,
                target.len(),
                prices.len()
            )));
        }
        if let Some(&bad) = legs.iter().find(|&&i| i >= n) {
            return Err(BacktestError::InvalidInput(format!(
                "Asset index {} outside a universe of {}",
                bad, n
            )));
        }
        let mut legs = legs.to_vec();
        legs.sort_unstable();
        legs.dedup();

        let total_value = self.value(prices);
        let mut report = RebalanceReport::default();

        for i in legs {
            let asset = &self.assets[i];
            let price = prices[i];

            if !is_valid_price(price) {
                warn!(
                    "{}",
                    BacktestError::InvalidPrice {
                        asset: asset.clone(),
                        price
                    }
                );
                report.skipped.push(SkippedLeg {
                    asset: asset.clone(),
                    reason: SkipReason::InvalidPrice,
                });
                continue;
            }

            let lot = self.lot_sizes[i];
            let current_value = self.shares[i] as f64 * price;
            let diff = target[i] * total_value - current_value;

            if diff.abs() < min_trade_value {
                report.skipped.push(SkippedLeg {
                    asset: asset.clone(),
                    reason: SkipReason::BelowMinTrade,
                });
                continue;
            }

            let mut delta = (diff / price / lot as f64).round() as i64 * lot;
            if delta == 0 {
                report.skipped.push(SkippedLeg {
                    asset: asset.clone(),
                    reason: SkipReason::ZeroLots,
                });
                continue;
            }

            let mut trade_value = delta.unsigned_abs() as f64 * price;
            let mut commission = self.cost_model.calculate_commission(trade_value);

            if delta > 0 {
                if trade_value + commission > self.cash {
                    debug!(
                        "{} on {}: shrinking buy",
                        BacktestError::InsufficientCash {
                            required: trade_value + commission,
                            available: self.cash
                        },
                        asset
                    );
                    let affordable = self.cash - commission;
                    delta = if affordable > 0.0 {
                        (affordable / price / lot as f64).floor() as i64 * lot
                    } else {
                        0
                    };
                    if delta <= 0 {
                        report.skipped.push(SkippedLeg {
                            asset: asset.clone(),
                            reason: SkipReason::Unaffordable,
                        });
                        continue;
                    }
                    trade_value = delta as f64 * price;
                    commission = self.cost_model.calculate_commission(trade_value);
                    if trade_value + commission > self.cash {
                        report.skipped.push(SkippedLeg {
                            asset: asset.clone(),
                            reason: SkipReason::Unaffordable,
                        });
                        continue;
                    }
                }
                self.cash -= trade_value + commission;
            } else {
                let held = self.shares[i];
                let sellable = held / lot * lot;
                if -delta > sellable {
                    debug!(
                        "{}: clipping sell",
                        BacktestError::InsufficientShares {
                            asset: asset.clone(),
                            requested: -delta,
                            held
                        }
                    );
                    delta = -sellable;
                    if delta == 0 {
                        report.skipped.push(SkippedLeg {
                            asset: asset.clone(),
                            reason: SkipReason::ZeroLots,
                        });
                        continue;
                    }
                    trade_value = delta.unsigned_abs() as f64 * price;
                    commission = self.cost_model.calculate_commission(trade_value);
                }
                self.cash += trade_value - commission;
            }

            self.shares[i] += delta;
            self.total_commissions += commission;
            self.traded_value += trade_value;
            report.commission += commission;

            let trade = TradeRecord {
                date,
                asset: asset.clone(),
                shares: delta,
                price,
                value: trade_value,
                commission,
                side: if delta > 0 { Side::Buy } else { Side::Sell },
            };
            debug!(
                "{} {} {} @ {:.4} (commission {:.2})",
                trade.side, trade.shares.abs(), trade.asset, price, commission
            );
            self.trades.push(trade.clone());
            report.trades.push(trade);
        }

        Ok(report)
    }
}
