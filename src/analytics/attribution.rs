//! Return attribution over a backtest's weight history.
//!
//! Each day's contribution of an asset is the weight in force at the prior
//! close times the asset's return over the day. Weights carry forward from
//! one snapshot to the next.

use super::{annual_return, annual_volatility, max_drawdown, sharpe_ratio, PERIODS_PER_YEAR};
use crate::data::PriceSeries;
use crate::types::{EquityPoint, WeightSnapshot};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Daily per-asset return contributions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionTable {
    pub assets: Vec<String>,
    pub dates: Vec<NaiveDate>,
    /// `contributions[t][asset]`.
    pub contributions: Vec<Vec<f64>>,
}

impl ContributionTable {
    /// Attribute returns in `prices` to the weights of `history`.
    ///
    /// Days before the first snapshot are left out. A return involving an
    /// invalid price contributes zero.
    pub fn from_weight_history(prices: &PriceSeries, history: &[WeightSnapshot]) -> Self {
        let assets = prices.assets().to_vec();
        let mut dates = Vec::new();
        let mut contributions = Vec::new();

        let mut next = 0;
        let mut held: Option<Vec<f64>> = None;

        for day in 1..prices.len() {
            let yesterday = prices.date(day - 1);
            while next < history.len() && history[next].date <= yesterday {
                let snapshot = &history[next];
                held = Some(
                    assets
                        .iter()
                        .map(|a| snapshot.weights.get(a).copied().unwrap_or(0.0))
                        .collect(),
                );
                next += 1;
            }
            let Some(weights) = &held else {
                continue;
            };

            let prev = prices.row(day - 1);
            let row = prices.row(day);
            let contribution = weights
                .iter()
                .zip(prev.iter().zip(row))
                .map(|(w, (&p0, &p1))| {
                    if valid(p0) && valid(p1) {
                        w * (p1 / p0 - 1.0)
                    } else {
                        0.0
                    }
                })
                .collect();

            dates.push(prices.date(day));
            contributions.push(contribution);
        }

        Self {
            assets,
            dates,
            contributions,
        }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    /// Rows dated within `[start, end]`.
    pub fn between(&self, start: NaiveDate, end: NaiveDate) -> Self {
        let (dates, contributions) = self
            .dates
            .iter()
            .zip(&self.contributions)
            .filter(|(d, _)| (start..=end).contains(*d))
            .map(|(d, c)| (*d, c.clone()))
            .unzip();
        Self {
            assets: self.assets.clone(),
            dates,
            contributions,
        }
    }

    /// Sum over assets for each day.
    pub fn daily_totals(&self) -> Vec<f64> {
        self.contributions.iter().map(|c| c.iter().sum()).collect()
    }

    /// Summed contribution per asset, largest first.
    pub fn totals(&self) -> Vec<(String, f64)> {
        let mut totals: Vec<(String, f64)> = self
            .assets
            .iter()
            .enumerate()
            .map(|(i, a)| (a.clone(), self.contributions.iter().map(|c| c[i]).sum()))
            .collect();
        totals.sort_by(|a, b| b.1.total_cmp(&a.1));
        totals
    }

    /// Compounded contribution per asset through each day.
    pub fn cumulative(&self) -> Vec<Vec<f64>> {
        let mut growth = vec![1.0; self.assets.len()];
        self.contributions
            .iter()
            .map(|c| {
                growth
                    .iter_mut()
                    .zip(c)
                    .map(|(g, x)| {
                        *g *= 1.0 + x;
                        *g - 1.0
                    })
                    .collect()
            })
            .collect()
    }

    /// Daily contributions summed over each class's members. Members outside
    /// the universe are ignored and classes with no members are left out.
    pub fn by_class(&self, classes: &BTreeMap<String, Vec<String>>) -> BTreeMap<String, Vec<f64>> {
        classes
            .iter()
            .filter_map(|(name, members)| {
                let idx: Vec<usize> = members
                    .iter()
                    .filter_map(|m| self.assets.iter().position(|a| a == m))
                    .collect();
                if idx.is_empty() {
                    return None;
                }
                let series = self
                    .contributions
                    .iter()
                    .map(|c| idx.iter().map(|&i| c[i]).sum())
                    .collect();
                Some((name.clone(), series))
            })
            .collect()
    }

    /// Portfolio return and per-asset contribution for each calendar year
    /// of `equity`.
    pub fn annual(&self, equity: &[EquityPoint]) -> Vec<AnnualAttribution> {
        let mut years: Vec<i32> = equity.iter().map(|p| p.date.year()).collect();
        years.dedup();

        years
            .into_iter()
            .filter_map(|year| {
                let points: Vec<&EquityPoint> =
                    equity.iter().filter(|p| p.date.year() == year).collect();
                let (first, last) = (points.first()?, points.last()?);
                let portfolio_return = if first.value > 0.0 {
                    last.value / first.value - 1.0
                } else {
                    0.0
                };

                let mut contributions: BTreeMap<String, f64> =
                    self.assets.iter().map(|a| (a.clone(), 0.0)).collect();
                for (date, row) in self.dates.iter().zip(&self.contributions) {
                    if date.year() == year {
                        for (asset, c) in self.assets.iter().zip(row) {
                            *contributions.entry(asset.clone()).or_default() += c;
                        }
                    }
                }

                Some(AnnualAttribution {
                    year,
                    portfolio_return,
                    contributions,
                })
            })
            .collect()
    }
}

fn valid(price: f64) -> bool {
    price.is_finite() && price > 0.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnualAttribution {
    pub year: i32,
    /// First-to-last equity change within the year.
    pub portfolio_return: f64,
    pub contributions: BTreeMap<String, f64>,
}

/// Calendar bucket for period returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Monthly,
    Annual,
}

impl Period {
    fn key(&self, date: NaiveDate) -> (i32, u32) {
        match self {
            Period::Monthly => (date.year(), date.month()),
            Period::Annual => (date.year(), 0),
        }
    }

    fn label(&self, key: (i32, u32)) -> String {
        match self {
            Period::Monthly => format!("{}-{:02}", key.0, key.1),
            Period::Annual => key.0.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodReturn {
    pub label: String,
    pub start_value: f64,
    pub end_value: f64,
    pub period_return: f64,
}

/// Return of each calendar period from the previous period's closing value
/// (the first point's value for the first period) to its own.
pub fn period_returns(equity: &[EquityPoint], period: Period) -> Vec<PeriodReturn> {
    let mut closes: Vec<((i32, u32), f64)> = Vec::new();
    for point in equity {
        let key = period.key(point.date);
        match closes.last_mut() {
            Some((k, v)) if *k == key => *v = point.value,
            _ => closes.push((key, point.value)),
        }
    }

    let mut start = equity.first().map_or(0.0, |p| p.value);
    closes
        .into_iter()
        .map(|(key, end)| {
            let period_return = if start > 0.0 { end / start - 1.0 } else { 0.0 };
            let row = PeriodReturn {
                label: period.label(key),
                start_value: start,
                end_value: end,
                period_return,
            };
            start = end;
            row
        })
        .collect()
}

/// Trailing-window statistics ending at `end` (index into the return series).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollingMetrics {
    pub end: usize,
    pub annual_return: f64,
    pub volatility: f64,
    pub sharpe_ratio: f64,
    /// Negative fraction.
    pub max_drawdown: f64,
}

/// Metrics over every full `window` of `returns`.
pub fn rolling_metrics(returns: &[f64], window: usize, risk_free_rate: f64) -> Vec<RollingMetrics> {
    if window == 0 || returns.len() < window {
        return Vec::new();
    }

    returns
        .windows(window)
        .enumerate()
        .map(|(i, w)| {
            let growth: Vec<f64> = w
                .iter()
                .scan(1.0, |g, r| {
                    *g *= 1.0 + r;
                    Some(*g)
                })
                .collect();
            RollingMetrics {
                end: i + window - 1,
                annual_return: annual_return(w, PERIODS_PER_YEAR),
                volatility: annual_volatility(w, PERIODS_PER_YEAR),
                sharpe_ratio: sharpe_ratio(w, risk_free_rate, PERIODS_PER_YEAR),
                max_drawdown: max_drawdown(&growth),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificantMove {
    pub date: NaiveDate,
    pub period_return: f64,
    pub value_before: f64,
    pub value_after: f64,
}

/// Days whose absolute return exceeds `threshold`, worst first.
pub fn significant_moves(equity: &[EquityPoint], threshold: f64) -> Vec<SignificantMove> {
    let mut moves: Vec<SignificantMove> = equity
        .windows(2)
        .filter(|w| w[0].value > 0.0)
        .filter_map(|w| {
            let r = w[1].value / w[0].value - 1.0;
            (r.abs() > threshold).then(|| SignificantMove {
                date: w[1].date,
                period_return: r,
                value_before: w[0].value,
                value_after: w[1].value,
            })
        })
        .collect();
    moves.sort_by(|a, b| a.period_return.total_cmp(&b.period_return));
    moves
}
