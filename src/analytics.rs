//! Performance metrics and result reporting.

pub mod attribution;

use crate::engine::BacktestResult;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use tabled::{builder::Builder, settings::Style};

/// Default annual risk-free rate.
pub const DEFAULT_RISK_FREE_RATE: f64 = 0.03;

/// Trading days per year.
pub const PERIODS_PER_YEAR: f64 = 252.0;

/// Volatilities below this are treated as zero.
const MIN_VOL: f64 = 1e-12;

/// Annualized geometric return.
pub fn annual_return(returns: &[f64], periods_per_year: f64) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    let growth: f64 = returns.iter().map(|r| 1.0 + r).product();
    growth.powf(periods_per_year / returns.len() as f64) - 1.0
}

fn sample_std(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
}

/// Annualized sample standard deviation.
pub fn annual_volatility(returns: &[f64], periods_per_year: f64) -> f64 {
    sample_std(returns) * periods_per_year.sqrt()
}

pub fn sharpe_ratio(returns: &[f64], risk_free_rate: f64, periods_per_year: f64) -> f64 {
    let vol = annual_volatility(returns, periods_per_year);
    if vol < MIN_VOL {
        return 0.0;
    }
    (annual_return(returns, periods_per_year) - risk_free_rate) / vol
}

/// Sortino ratio over the sample std of negative returns. Infinite without
/// downside.
pub fn sortino_ratio(returns: &[f64], risk_free_rate: f64, periods_per_year: f64) -> f64 {
    let downside: Vec<f64> = returns.iter().copied().filter(|&r| r < 0.0).collect();
    if downside.is_empty() {
        return f64::INFINITY;
    }
    let downside_vol = sample_std(&downside) * periods_per_year.sqrt();
    if downside_vol < MIN_VOL {
        return f64::INFINITY;
    }
    (annual_return(returns, periods_per_year) - risk_free_rate) / downside_vol
}

/// Worst peak-to-trough decline as a negative fraction.
pub fn max_drawdown(equity: &[f64]) -> f64 {
    let mut peak = f64::NEG_INFINITY;
    let mut worst = 0.0f64;
    for &v in equity {
        peak = peak.max(v);
        if peak > 0.0 {
            worst = worst.min((v - peak) / peak);
        }
    }
    worst
}

pub fn calmar_ratio(returns: &[f64], equity: &[f64], periods_per_year: f64) -> f64 {
    let dd = max_drawdown(equity).abs();
    if dd == 0.0 {
        return f64::INFINITY;
    }
    annual_return(returns, periods_per_year) / dd
}

/// Fraction of strictly positive periods.
pub fn win_rate(returns: &[f64]) -> f64 {
    if returns.is_empty() {
        return 0.0;
    }
    returns.iter().filter(|&&r| r > 0.0).count() as f64 / returns.len() as f64
}

/// Period-over-period returns of an equity path.
pub fn returns_from_equity(equity: &[f64]) -> Vec<f64> {
    equity
        .windows(2)
        .map(|w| if w[0] > 0.0 { w[1] / w[0] - 1.0 } else { 0.0 })
        .collect()
}

/// Summary performance statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return: f64,
    pub annual_return: f64,
    pub annual_volatility: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    /// Negative fraction.
    pub max_drawdown: f64,
    pub calmar_ratio: f64,
    pub win_rate: f64,
    pub periods: usize,
}

impl PerformanceMetrics {
    /// Metrics of an equity path (one value per period).
    pub fn from_equity(equity: &[f64], risk_free_rate: f64) -> Self {
        let returns = returns_from_equity(equity);
        let total_return = match (equity.first(), equity.last()) {
            (Some(&first), Some(&last)) if first > 0.0 => last / first - 1.0,
            _ => 0.0,
        };

        Self {
            total_return,
            annual_return: annual_return(&returns, PERIODS_PER_YEAR),
            annual_volatility: annual_volatility(&returns, PERIODS_PER_YEAR),
            sharpe_ratio: sharpe_ratio(&returns, risk_free_rate, PERIODS_PER_YEAR),
            sortino_ratio: sortino_ratio(&returns, risk_free_rate, PERIODS_PER_YEAR),
            max_drawdown: max_drawdown(equity),
            calmar_ratio: calmar_ratio(&returns, equity, PERIODS_PER_YEAR),
            win_rate: win_rate(&returns),
            periods: returns.len(),
        }
    }
}

/// Format results for terminal display.
pub struct ResultFormatter;

impl ResultFormatter {
    /// Print a results report to stdout.
    pub fn print_report(result: &BacktestResult) {
        let m = &result.metrics;

        println!();
        println!("{}", "═".repeat(60).blue());
        println!("{}", " BACKTEST RESULTS ".bold().blue());
        println!("{}", "═".repeat(60).blue());
        println!();

        println!("{}", "Overview".bold().underline());
        println!("  Assets:          {}", result.assets.join(", "));
        if let (Some(first), Some(last)) = (result.equity_curve.first(), result.equity_curve.last()) {
            println!("  Period:          {} to {}", first.date, last.date);
        }
        println!("  Trading Days:    {}", result.equity_curve.len());
        println!();

        println!("{}", "Performance".bold().underline());
        println!("  Initial Capital: {:>14.2}", result.initial_capital);
        println!(
            "  Final Value:     {:>14.2}  {}",
            result.final_value,
            Self::format_pct_change(result.total_return * 100.0)
        );
        println!("  Annual Return:   {:>13.2}%", m.annual_return * 100.0);
        println!("  Volatility:      {:>13.2}%", m.annual_volatility * 100.0);
        println!("  Max Drawdown:    {:>13.2}%", m.max_drawdown * 100.0);
        println!("  Sharpe Ratio:    {:>14.2}", m.sharpe_ratio);
        println!("  Sortino Ratio:   {:>14.2}", m.sortino_ratio);
        println!("  Calmar Ratio:    {:>14.2}", m.calmar_ratio);
        println!("  Win Rate:        {:>13.1}%", m.win_rate * 100.0);
        println!();

        println!("{}", "Rebalancing".bold().underline());
        println!("  Executed:        {:>14}", result.rebalances_executed);
        println!("  Skipped:         {:>14}", result.rebalances_skipped);
        println!("  Drift Rebalances:{:>14}", result.partial_rebalances);
        println!("  Efficiency:      {:>13.1}%", result.rebalance_efficiency * 100.0);
        println!("  Optimizer Fallbacks: {:>10}", result.optimizer_fallbacks);
        println!("  Crisis Days:     {:>14}", result.crisis_days.len());
        println!("  Trades:          {:>14}", result.trade_count);
        println!("  Commissions:     {:>14.2}", result.total_commissions);
        println!("  Turnover:        {:>14.2}x", result.turnover);
        println!();

        println!("{}", "═".repeat(60).blue());
    }

    fn format_pct_change(pct: f64) -> String {
        if pct >= 0.0 {
            format!("(+{:.2}%)", pct).green().to_string()
        } else {
            format!("({:.2}%)", pct).red().to_string()
        }
    }

    /// Print one row per labelled result.
    pub fn print_table(results: &[(String, BacktestResult)]) {
        let mut builder = Builder::new();
        builder.push_record([
            "Run", "Return %", "Annual %", "Max DD %", "Sharpe", "Rebalances", "Trades", "Costs",
        ]);

        for (label, result) in results {
            builder.push_record([
                label.clone(),
                format!("{:.2}", result.total_return * 100.0),
                format!("{:.2}", result.metrics.annual_return * 100.0),
                format!("{:.2}", result.metrics.max_drawdown * 100.0),
                format!("{:.2}", result.metrics.sharpe_ratio),
                result.rebalances_executed.to_string(),
                result.trade_count.to_string(),
                format!("{:.0}", result.total_commissions),
            ]);
        }

        let table = builder.build().with(Style::rounded()).to_string();
        println!("{}", table);
    }

    /// Print summed contribution per asset.
    pub fn print_attribution(table: &attribution::ContributionTable) {
        let mut builder = Builder::new();
        builder.push_record(["Asset", "Contribution %"]);
        for (asset, total) in table.totals() {
            builder.push_record([asset, format!("{:.2}", total * 100.0)]);
        }
        println!("{}", "Return Attribution".bold().underline());
        println!("{}", builder.build().with(Style::rounded()));
        println!();
    }

    /// Export results to JSON.
    pub fn to_json(result: &BacktestResult) -> String {
        serde_json::to_string_pretty(result).unwrap_or_else(|_| "{}".to_string())
    }
}
