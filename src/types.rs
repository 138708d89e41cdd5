//! Core types shared by the ledger, the engine and the result.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Trade side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// An executed trade leg. Created only by `Portfolio::rebalance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Execution date.
    pub date: NaiveDate,
    /// Asset traded.
    pub asset: String,
    /// Signed share count (positive for buys, negative for sells).
    pub shares: i64,
    /// Execution price.
    pub price: f64,
    /// Gross trade value (`|shares| * price`).
    pub value: f64,
    /// Commission paid on this leg.
    pub commission: f64,
    /// Trade side.
    pub side: Side,
}

/// Portfolio value snapshot at the start of a simulated day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
    pub cash: f64,
    pub positions_value: f64,
    pub drawdown: f64,
    pub drawdown_pct: f64,
}

/// Target weights applied by an executed rebalance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightSnapshot {
    pub date: NaiveDate,
    pub weights: BTreeMap<String, f64>,
    /// Whether the weights came from the crisis override.
    #[serde(default)]
    pub defensive: bool,
}

/// Why a rebalance leg produced no trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    /// Price missing, non-finite or non-positive.
    InvalidPrice,
    /// Value difference below the minimum trade value.
    BelowMinTrade,
    /// The difference rounds to zero lots.
    ZeroLots,
    /// Not enough cash for even one lot after commission.
    Unaffordable,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::InvalidPrice => write!(f, "invalid price"),
            SkipReason::BelowMinTrade => write!(f, "below minimum trade value"),
            SkipReason::ZeroLots => write!(f, "rounds to zero lots"),
            SkipReason::Unaffordable => write!(f, "insufficient cash"),
        }
    }
}

/// A leg that was evaluated but not traded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedLeg {
    pub asset: String,
    pub reason: SkipReason,
}
