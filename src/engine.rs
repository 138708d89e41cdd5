//! Backtest execution engine.

use crate::analytics::{returns_from_equity, PerformanceMetrics, DEFAULT_RISK_FREE_RATE};
use crate::crisis::{CrisisConfig, CrisisDetector, CrisisSignals};
use crate::data::PriceSeries;
use crate::environment::EnvironmentMap;
use crate::error::{BacktestError, Result};
use crate::metadata::RunFingerprint;
use crate::optimizer::{AllocationConstraints, OptimizerConfig, RiskParityOptimizer};
use crate::portfolio::{CostModel, Portfolio};
use crate::types::{EquityPoint, TradeRecord, WeightSnapshot};
use crate::vol_target::VolatilityTargeter;
use chrono::{Datelike, NaiveDate, Weekday};
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// When the engine considers rebalancing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    /// Every trading day.
    Daily,
    /// First trading day of each ISO week falling on or after the weekday.
    Weekly(Weekday),
    /// First trading day of each calendar month.
    Monthly,
}

impl Default for Cadence {
    fn default() -> Self {
        Cadence::Weekly(Weekday::Mon)
    }
}

impl Cadence {
    /// Whether `dates[day]` is a decision point. Only `dates[..=day]` is read.
    pub fn is_decision_point(&self, dates: &[NaiveDate], day: usize) -> bool {
        let Some(&date) = dates.get(day) else {
            return false;
        };
        let prev = day.checked_sub(1).map(|p| dates[p]);

        match *self {
            Cadence::Daily => true,
            Cadence::Weekly(weekday) => {
                let on_or_after = |d: NaiveDate| {
                    d.weekday().num_days_from_monday() >= weekday.num_days_from_monday()
                };
                if !on_or_after(date) {
                    return false;
                }
                match prev {
                    Some(p) => !(p.iso_week() == date.iso_week() && on_or_after(p)),
                    None => true,
                }
            }
            Cadence::Monthly => match prev {
                Some(p) => p.year() != date.year() || p.month() != date.month(),
                None => true,
            },
        }
    }
}

/// How a rebalance moves the portfolio back to target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceMode {
    /// Trade every asset at a decision point once the largest drift exceeds
    /// the threshold.
    #[default]
    Portfolio,
    /// Refresh the target at decision points and trade individual assets
    /// back to it on any other day they drift past the threshold.
    PerAsset,
}

/// Configuration for the backtest engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Initial capital for the backtest.
    pub initial_capital: f64,
    /// Trading costs configuration.
    pub cost_model: CostModel,
    /// Default lot size in shares.
    pub lot_size: i64,
    /// Per-asset lot size overrides.
    pub lot_sizes: BTreeMap<String, i64>,
    /// Legs worth less than this are not traded.
    pub min_trade_value: f64,
    /// Prices per return window (yields `lookback - 1` returns).
    pub lookback: usize,
    pub cadence: Cadence,
    /// Max weight drift tolerated before trading. Zero always rebalances.
    pub drift_threshold: f64,
    pub rebalance_mode: RebalanceMode,
    pub optimizer: OptimizerConfig,
    pub constraints: AllocationConstraints,
    pub environments: EnvironmentMap,
    /// Crisis overlay, disabled when `None`.
    pub crisis: Option<CrisisConfig>,
    /// Volatility targeting, disabled when `None`.
    pub vol_target: Option<VolatilityTargeter>,
    /// First simulated day. Defaults to `lookback`.
    pub start_index: Option<usize>,
    /// One past the last simulated day. Defaults to the end of the data.
    pub end_index: Option<usize>,
    /// Annual risk-free rate for reported Sharpe and Sortino ratios.
    pub metrics_risk_free_rate: f64,
    /// Show progress bar during backtest.
    #[serde(skip)]
    pub show_progress: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 1_000_000.0,
            cost_model: CostModel::default(),
            lot_size: 100,
            lot_sizes: BTreeMap::new(),
            min_trade_value: 100.0,
            lookback: 252,
            cadence: Cadence::default(),
            drift_threshold: 0.05,
            rebalance_mode: RebalanceMode::default(),
            optimizer: OptimizerConfig::default(),
            constraints: AllocationConstraints::default(),
            environments: EnvironmentMap::default(),
            crisis: None,
            vol_target: None,
            start_index: None,
            end_index: None,
            metrics_risk_free_rate: DEFAULT_RISK_FREE_RATE,
            show_progress: false,
        }
    }
}

impl BacktestConfig {
    /// Check the configuration against a universe.
    pub fn validate(&self, assets: &[String]) -> Result<()> {
        if assets.is_empty() {
            return Err(BacktestError::ConfigError("Universe is empty".to_string()));
        }
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(BacktestError::ConfigError(format!(
                "Initial capital must be positive, got {}",
                self.initial_capital
            )));
        }
        if self.lookback < 2 {
            return Err(BacktestError::ConfigError(format!(
                "Lookback must be at least 2, got {}",
                self.lookback
            )));
        }
        if !(self.drift_threshold.is_finite() && self.drift_threshold >= 0.0) {
            return Err(BacktestError::ConfigError(format!(
                "Drift threshold must be non-negative, got {}",
                self.drift_threshold
            )));
        }
        if !(self.cost_model.commission_rate >= 0.0 && self.cost_model.min_commission >= 0.0) {
            return Err(BacktestError::ConfigError(
                "Commission parameters must be non-negative".to_string(),
            ));
        }
        if self.min_trade_value < 0.0 {
            return Err(BacktestError::ConfigError(
                "Minimum trade value must be non-negative".to_string(),
            ));
        }
        if self.lot_size < 1 {
            return Err(BacktestError::ConfigError(format!(
                "Lot size must be at least 1, got {}",
                self.lot_size
            )));
        }
        for (asset, &lot) in &self.lot_sizes {
            if !assets.contains(asset) {
                return Err(BacktestError::ConfigError(format!(
                    "Lot size given for unknown asset {}",
                    asset
                )));
            }
            if lot < 1 {
                return Err(BacktestError::ConfigError(format!(
                    "Lot size for {} must be at least 1, got {}",
                    asset, lot
                )));
            }
        }
        if let Some(targeter) = &self.vol_target {
            if !(targeter.target_vol > 0.0 && targeter.max_leverage > 0.0) {
                return Err(BacktestError::ConfigError(
                    "Volatility target and max leverage must be positive".to_string(),
                ));
            }
        }
        if let Some(crisis) = &self.crisis {
            if crisis.vote_threshold == 0 || crisis.vote_threshold > 3 {
                return Err(BacktestError::ConfigError(format!(
                    "Crisis vote threshold must be between 1 and 3, got {}",
                    crisis.vote_threshold
                )));
            }
        }
        self.constraints.validate(assets)
    }

    /// Simulated day range `[start, end)` over `len` rows.
    fn day_range(&self, len: usize) -> Result<(usize, usize)> {
        let start = self.start_index.unwrap_or(self.lookback);
        let end = self.end_index.map_or(len, |e| e.min(len));
        if start >= end {
            return Err(BacktestError::ConfigError(format!(
                "Start day {} is beyond the data ({} rows, end {})",
                start, len, end
            )));
        }
        Ok((start, end))
    }
}

// ============================================================================
// Drift
// ============================================================================

/// Largest absolute weight difference between two allocations.
pub fn max_drift(current: &[f64], target: &[f64]) -> f64 {
    current
        .iter()
        .zip(target)
        .map(|(c, t)| (c - t).abs())
        .fold(0.0, f64::max)
}

/// Indices of assets whose weight differs from target by more than
/// `threshold`.
pub fn drifted_assets(current: &[f64], target: &[f64], threshold: f64) -> Vec<usize> {
    current
        .iter()
        .zip(target)
        .enumerate()
        .filter(|(_, (c, t))| (*c - *t).abs() > threshold)
        .map(|(i, _)| i)
        .collect()
}

/// Tracks the last executed target and decides whether drift warrants a trade.
#[derive(Debug, Clone, Default)]
pub struct DriftMonitor {
    threshold: f64,
    last_target: Option<Vec<f64>>,
}

impl DriftMonitor {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            last_target: None,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn baseline(&self) -> Option<&[f64]> {
        self.last_target.as_deref()
    }

    /// Returns `(rebalance, drift)`. Without a baseline or with a zero
    /// threshold the answer is always yes.
    pub fn should_rebalance(&self, current: &[f64]) -> (bool, f64) {
        match &self.last_target {
            None => (true, 0.0),
            Some(target) => {
                let drift = max_drift(current, target);
                (self.threshold == 0.0 || drift > self.threshold, drift)
            }
        }
    }

    /// Record an executed target.
    pub fn set_baseline(&mut self, target: Vec<f64>) {
        self.last_target = Some(target);
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// No rebalance executed yet.
    NoPosition,
    /// Holding a target allocation.
    Tracking,
}

/// Results from a backtest run.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestResult {
    pub assets: Vec<String>,
    /// Configuration used.
    pub config: BacktestConfig,
    pub initial_capital: f64,
    pub final_value: f64,
    pub total_return: f64,
    pub equity_curve: Vec<EquityPoint>,
    /// Day-over-day returns of the equity path.
    pub returns: Vec<f64>,
    /// One row per adopted target.
    pub weight_history: Vec<WeightSnapshot>,
    pub trades: Vec<TradeRecord>,
    pub decision_points: usize,
    pub rebalances_executed: usize,
    pub rebalances_skipped: usize,
    /// Decision points dropped for an unusable return window.
    pub windows_rejected: usize,
    /// Days on which drifted assets alone were traded back to target.
    pub partial_rebalances: usize,
    /// `1 - skipped / decision_points`.
    pub rebalance_efficiency: f64,
    pub optimizer_fallbacks: usize,
    pub total_commissions: f64,
    pub trade_count: usize,
    pub turnover: f64,
    /// Days spent in crisis mode.
    pub crisis_days: Vec<NaiveDate>,
    /// Days on which crisis mode was entered.
    pub crisis_entries: Vec<NaiveDate>,
    pub metrics: PerformanceMetrics,
    pub fingerprint: RunFingerprint,
}

/// Per-run simulation state over a shared price table.
pub struct BacktestEngine<'a> {
    config: BacktestConfig,
    prices: &'a PriceSeries,
    portfolio: Portfolio,
    optimizer: RiskParityOptimizer,
    crisis: Option<CrisisDetector>,
    drift: DriftMonitor,
    state: EngineState,
    regime_changed: bool,
    weight_history: Vec<WeightSnapshot>,
    crisis_days: Vec<NaiveDate>,
    crisis_entries: Vec<NaiveDate>,
    decision_points: usize,
    executed: usize,
    skipped: usize,
    windows_rejected: usize,
    partial_rebalances: usize,
    fallbacks: usize,
}

impl<'a> BacktestEngine<'a> {
    /// Validate `config` against `prices` and set up a fresh ledger.
    pub fn new(config: BacktestConfig, prices: &'a PriceSeries) -> Result<Self> {
        let assets = prices.assets().to_vec();
        config.validate(&assets)?;
        config.day_range(prices.len())?;

        let mut portfolio = Portfolio::new(
            assets.clone(),
            config.initial_capital,
            config.cost_model,
            config.lot_size,
        );
        for (asset, &lot) in &config.lot_sizes {
            portfolio.set_lot_size(asset, lot)?;
        }

        let optimizer = RiskParityOptimizer::new(config.optimizer.clone())
            .with_constraints(config.constraints.clone())
            .with_environments(config.environments.clone());
        let crisis = config
            .crisis
            .clone()
            .map(|c| CrisisDetector::new(c, &assets));
        let drift = DriftMonitor::new(config.drift_threshold);

        Ok(Self {
            config,
            prices,
            portfolio,
            optimizer,
            crisis,
            drift,
            state: EngineState::NoPosition,
            regime_changed: false,
            weight_history: Vec::new(),
            crisis_days: Vec::new(),
            crisis_entries: Vec::new(),
            decision_points: 0,
            executed: 0,
            skipped: 0,
            windows_rejected: 0,
            partial_rebalances: 0,
            fallbacks: 0,
        })
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn portfolio(&self) -> &Portfolio {
        &self.portfolio
    }

    pub fn drift_monitor(&self) -> &DriftMonitor {
        &self.drift
    }

    /// Simulate every configured day and compile the result.
    pub fn run(mut self) -> Result<BacktestResult> {
        let (start, end) = self.config.day_range(self.prices.len())?;

        info!(
            "Running backtest: {} assets, {} days ({} to {})",
            self.prices.n_assets(),
            end - start,
            self.prices.date(start),
            self.prices.date(end - 1)
        );

        let progress = if self.config.show_progress {
            let pb = ProgressBar::new((end - start) as u64);
            if let Ok(style) = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            {
                pb.set_style(style.progress_chars("#>-"));
            }
            Some(pb)
        } else {
            None
        };

        for day in start..end {
            self.step(day)?;
            if let Some(ref pb) = progress {
                pb.inc(1);
            }
        }

        if let Some(pb) = progress {
            pb.finish_with_message("Backtest complete");
        }

        Ok(self.finish())
    }

    /// Simulate one day: mark, update crisis state, and rebalance at a
    /// decision point when warranted.
    pub fn step(&mut self, day: usize) -> Result<()> {
        let prices = self.prices;
        let row = prices.row(day);
        let date = prices.date(day);

        self.portfolio.record_equity(date, row);

        if let Some(detector) = self.crisis.as_mut() {
            let state = match day.checked_sub(1) {
                Some(yesterday) => detector.update(prices, yesterday),
                None => detector.advance(CrisisSignals::default()),
            };
            if state.is_crisis {
                self.crisis_days.push(date);
            }
            if state.changed {
                self.regime_changed = true;
                if state.is_crisis {
                    self.crisis_entries.push(date);
                }
            }
        }

        if !self.config.cadence.is_decision_point(prices.dates(), day) {
            if self.config.rebalance_mode == RebalanceMode::PerAsset {
                self.rebalance_drifted(day)?;
            }
            return Ok(());
        }
        self.decision_points += 1;

        let Some((target, defensive)) = self.target_weights(day)? else {
            self.windows_rejected += 1;
            return Ok(());
        };

        if self.config.rebalance_mode == RebalanceMode::PerAsset
            && self.state == EngineState::Tracking
            && !self.regime_changed
        {
            self.skipped += 1;
            self.record_target(date, &target, defensive);
            self.drift.set_baseline(target);
            info!("[{}] Target updated", date);
            return Ok(());
        }

        let current = self.portfolio.weights(row);
        let (needs_rebalance, drift) = self.drift.should_rebalance(&current);
        if !needs_rebalance && !self.regime_changed {
            self.skipped += 1;
            info!(
                "[{}] Skipped (drift {:.2}% <= {:.2}%)",
                date,
                drift * 100.0,
                self.drift.threshold() * 100.0
            );
            return Ok(());
        }

        let report = self
            .portfolio
            .rebalance(date, &target, row, self.config.min_trade_value)?;

        self.record_target(date, &target, defensive);
        self.drift.set_baseline(target);
        self.regime_changed = false;
        self.state = EngineState::Tracking;
        self.executed += 1;

        info!(
            "[{}] Rebalanced: {} trades, {} legs skipped, drift {:.2}%, value {:.0}",
            date,
            report.trades.len(),
            report.skipped.len(),
            drift * 100.0,
            self.portfolio.value(row)
        );
        Ok(())
    }

    /// Trade back to the baseline every asset whose weight drifted past the
    /// threshold.
    fn rebalance_drifted(&mut self, day: usize) -> Result<()> {
        let Some(target) = self.drift.baseline().map(<[f64]>::to_vec) else {
            return Ok(());
        };
        let prices = self.prices;
        let row = prices.row(day);
        let drifted = drifted_assets(&self.portfolio.weights(row), &target, self.drift.threshold());
        if drifted.is_empty() {
            return Ok(());
        }

        let date = prices.date(day);
        let report =
            self.portfolio
                .rebalance_assets(date, &target, row, self.config.min_trade_value, &drifted)?;
        if report.traded() {
            self.partial_rebalances += 1;
            info!(
                "[{}] Drift rebalance: {} of {} drifted assets traded",
                date,
                report.trades.len(),
                drifted.len()
            );
        }
        Ok(())
    }

    fn record_target(&mut self, date: NaiveDate, target: &[f64], defensive: bool) {
        self.weight_history.push(WeightSnapshot {
            date,
            weights: self
                .prices
                .assets()
                .iter()
                .cloned()
                .zip(target.iter().copied())
                .collect(),
            defensive,
        });
    }

    /// Today's target and whether it is the defensive allocation. `None`
    /// when the return window cannot be used.
    fn target_weights(&mut self, day: usize) -> Result<Option<(Vec<f64>, bool)>> {
        let prices = self.prices;
        let assets = prices.assets();

        if let Some(detector) = self.crisis.as_ref().filter(|d| d.is_crisis()) {
            return Ok(Some((detector.defensive_weights(assets), true)));
        }

        let date = prices.date(day);
        let outcome = match prices
            .return_window(day, self.config.lookback)
            .and_then(|window| self.optimizer.optimize(assets, &window))
        {
            Ok(outcome) => outcome,
            Err(BacktestError::DataError(msg)) => {
                warn!("[{}] Skipping rebalance: {}", date, msg);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if let Some(reason) = outcome.fallback_reason() {
            self.fallbacks += 1;
            debug!("[{}] Using fallback weights: {}", date, reason);
        }
        let mut weights = outcome.into_weights();

        if let Some(targeter) = &self.config.vol_target {
            let history = self.portfolio.equity_curve();
            let past: Vec<f64> = history[..history.len().saturating_sub(1)]
                .iter()
                .map(|p| p.value)
                .collect();
            weights = targeter.scale(&weights, &returns_from_equity(&past));
        }

        Ok(Some((weights, false)))
    }

    fn finish(self) -> BacktestResult {
        let equity_curve = self.portfolio.equity_curve().to_vec();
        let values: Vec<f64> = equity_curve.iter().map(|p| p.value).collect();
        let initial_capital = self.config.initial_capital;
        let final_value = values.last().copied().unwrap_or(initial_capital);
        let total_return = final_value / initial_capital - 1.0;

        let rebalance_efficiency = if self.decision_points > 0 {
            1.0 - self.skipped as f64 / self.decision_points as f64
        } else {
            0.0
        };

        let trades = self.portfolio.trades().to_vec();
        let fingerprint = RunFingerprint::compute(&self.config, &equity_curve, &trades);
        let metrics = PerformanceMetrics::from_equity(&values, self.config.metrics_risk_free_rate);

        info!(
            "Backtest complete: {} executed, {} skipped, {} fallbacks, commissions {:.2}",
            self.executed,
            self.skipped,
            self.fallbacks,
            self.portfolio.total_commissions()
        );

        BacktestResult {
            assets: self.prices.assets().to_vec(),
            initial_capital,
            final_value,
            total_return,
            returns: returns_from_equity(&values),
            equity_curve,
            weight_history: self.weight_history,
            trade_count: trades.len(),
            trades,
            decision_points: self.decision_points,
            rebalances_executed: self.executed,
            rebalances_skipped: self.skipped,
            windows_rejected: self.windows_rejected,
            partial_rebalances: self.partial_rebalances,
            rebalance_efficiency,
            optimizer_fallbacks: self.fallbacks,
            total_commissions: self.portfolio.total_commissions(),
            turnover: self.portfolio.turnover(),
            crisis_days: self.crisis_days,
            crisis_entries: self.crisis_entries,
            metrics,
            fingerprint,
            config: self.config,
        }
    }
}

/// Run one backtest.
pub fn run_backtest(prices: &PriceSeries, config: BacktestConfig) -> Result<BacktestResult> {
    BacktestEngine::new(config, prices)?.run()
}

/// Run independent configurations in parallel over the same prices.
///
/// Failed runs are logged and left out.
pub fn sweep(
    prices: &PriceSeries,
    configs: Vec<BacktestConfig>,
) -> Vec<(BacktestConfig, BacktestResult)> {
    configs
        .into_par_iter()
        .filter_map(|mut config| {
            // Disable progress for parallel runs
            config.show_progress = false;
            match run_backtest(prices, config.clone()) {
                Ok(result) => Some((config, result)),
                Err(e) => {
                    warn!("Sweep run failed: {}", e);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weekdays(start: NaiveDate, n: usize) -> Vec<NaiveDate> {
        start
            .iter_days()
            .filter(|d| d.weekday().num_days_from_monday() < 5)
            .take(n)
            .collect()
    }

    fn synthetic_prices(n: usize) -> PriceSeries {
        let assets = vec!["STK".to_string(), "BND".to_string(), "GLD".to_string()];
        let dates = weekdays(NaiveDate::from_ymd_opt(2020, 1, 6).unwrap(), n);
        let rows = (0..n)
            .map(|t| {
                let t = t as f64;
                vec![
                    100.0 * (1.0 + 0.0004 * t) + 3.0 * (t * 0.7).sin() + 1.5 * (t * 0.13).cos(),
                    50.0 * (1.0 + 0.0001 * t) + 0.3 * (t * 1.1).sin(),
                    80.0 + 0.01 * t + 1.2 * (t * 0.45).cos() + 0.8 * (t * 0.09).sin(),
                ]
            })
            .collect();
        PriceSeries::new(assets, dates, rows).unwrap()
    }

    fn quick_config() -> BacktestConfig {
        BacktestConfig {
            lookback: 30,
            lot_size: 10,
            ..BacktestConfig::default()
        }
    }

    #[test]
    fn test_drift_example() {
        let current = [0.56, 0.44];
        let target = [0.5, 0.5];
        assert!((max_drift(&current, &target) - 0.06).abs() < 1e-12);

        let mut monitor = DriftMonitor::new(0.05);
        monitor.set_baseline(target.to_vec());
        assert!(monitor.should_rebalance(&current).0);

        let mut loose = DriftMonitor::new(0.10);
        loose.set_baseline(target.to_vec());
        assert!(!loose.should_rebalance(&current).0);
    }

    #[test]
    fn test_drift_without_baseline_or_threshold() {
        let monitor = DriftMonitor::new(0.05);
        assert_eq!(monitor.should_rebalance(&[0.2, 0.8]), (true, 0.0));

        let mut always = DriftMonitor::new(0.0);
        always.set_baseline(vec![0.5, 0.5]);
        assert!(always.should_rebalance(&[0.5, 0.5]).0);
    }

    #[test]
    fn test_weekly_cadence_handles_holidays() {
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        // Mon 1 is a holiday; Tue 2 takes its place. Wed 3 opens the Wednesday week.
        let dates = vec![d(2), d(3), d(4), d(5), d(8), d(9)];
        let cadence = Cadence::Weekly(Weekday::Mon);
        let flags: Vec<bool> = (0..dates.len())
            .map(|i| cadence.is_decision_point(&dates, i))
            .collect();
        assert_eq!(flags, vec![true, false, false, false, true, false]);

        let wednesday = Cadence::Weekly(Weekday::Wed);
        let flags: Vec<bool> = (0..dates.len())
            .map(|i| wednesday.is_decision_point(&dates, i))
            .collect();
        assert_eq!(flags, vec![false, true, false, false, false, false]);
    }

    #[test]
    fn test_monthly_and_daily_cadence() {
        let dates = vec![
            NaiveDate::from_ymd_opt(2024, 1, 30).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 31).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 2).unwrap(),
        ];
        let monthly: Vec<bool> = (0..4).map(|i| Cadence::Monthly.is_decision_point(&dates, i)).collect();
        assert_eq!(monthly, vec![true, false, true, false]);
        assert!((0..4).all(|i| Cadence::Daily.is_decision_point(&dates, i)));
        assert!(!Cadence::Daily.is_decision_point(&dates, 4));
    }

    #[test]
    fn test_config_validation() {
        let assets = vec!["A".to_string(), "B".to_string()];
        assert!(BacktestConfig::default().validate(&assets).is_ok());

        let bad_lookback = BacktestConfig {
            lookback: 1,
            ..BacktestConfig::default()
        };
        assert!(matches!(
            bad_lookback.validate(&assets),
            Err(BacktestError::ConfigError(_))
        ));

        let bad_threshold = BacktestConfig {
            drift_threshold: -0.1,
            ..BacktestConfig::default()
        };
        assert!(bad_threshold.validate(&assets).is_err());

        let mut bad_lot = BacktestConfig::default();
        bad_lot.lot_sizes.insert("C".to_string(), 10);
        assert!(bad_lot.validate(&assets).is_err());

        assert!(BacktestConfig::default().validate(&[]).is_err());
    }

    #[test]
    fn test_start_beyond_data() {
        let prices = synthetic_prices(40);
        let config = BacktestConfig {
            lookback: 60,
            ..BacktestConfig::default()
        };
        assert!(matches!(
            BacktestEngine::new(config, &prices),
            Err(BacktestError::ConfigError(_))
        ));
    }

    #[test]
    fn test_simple_backtest() {
        let prices = synthetic_prices(150);
        let result = run_backtest(&prices, quick_config()).unwrap();

        assert_eq!(result.equity_curve.len(), 120);
        assert!(result.rebalances_executed >= 1);
        assert_eq!(
            result.rebalances_executed + result.rebalances_skipped + result.windows_rejected,
            result.decision_points
        );
        assert_eq!(result.weight_history.len(), result.rebalances_executed);
        assert_eq!(result.trade_count, result.trades.len());
        assert_eq!(result.returns.len(), result.equity_curve.len() - 1);
        assert!(result.equity_curve.iter().all(|p| p.cash >= 0.0));
        assert!((result.equity_curve[0].value - 1_000_000.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_decision_point_executes() {
        let prices = synthetic_prices(80);
        let config = quick_config();
        let mut engine = BacktestEngine::new(config, &prices).unwrap();
        assert_eq!(engine.state(), EngineState::NoPosition);

        let first = (30..80)
            .find(|&d| Cadence::default().is_decision_point(prices.dates(), d))
            .unwrap();
        for day in 30..=first {
            engine.step(day).unwrap();
        }
        assert_eq!(engine.state(), EngineState::Tracking);
        assert!(engine.drift_monitor().baseline().is_some());
        assert!(engine.portfolio().trade_count() > 0);
    }

    #[test]
    fn test_zero_threshold_always_rebalances() {
        let prices = synthetic_prices(150);
        let config = BacktestConfig {
            drift_threshold: 0.0,
            ..quick_config()
        };
        let result = run_backtest(&prices, config).unwrap();
        assert_eq!(result.rebalances_skipped, 0);
        assert_eq!(result.rebalances_executed, result.decision_points);
        assert!((result.rebalance_efficiency - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_short_start_rejects_windows() {
        let prices = synthetic_prices(60);
        let config = BacktestConfig {
            start_index: Some(0),
            cadence: Cadence::Daily,
            ..quick_config()
        };
        let result = run_backtest(&prices, config).unwrap();
        // Days 0..30 have fewer than 30 prior prices.
        assert_eq!(result.windows_rejected, 30);
        assert_eq!(result.equity_curve.len(), 60);
    }

    /// `synthetic_prices(n)` with asset 0 doubling on the Wednesday after the
    /// first decision point. Returns the prices and the jump day.
    fn jumped_prices(n: usize) -> (PriceSeries, usize) {
        let base = synthetic_prices(n);
        let first = (30..n)
            .find(|&d| Cadence::default().is_decision_point(base.dates(), d))
            .unwrap();
        let jump = first + 2;
        let rows = (0..n)
            .map(|d| {
                let mut row = base.row(d).to_vec();
                if d >= jump {
                    row[0] *= 2.0;
                }
                row
            })
            .collect();
        let prices =
            PriceSeries::new(base.assets().to_vec(), base.dates().to_vec(), rows).unwrap();
        (prices, jump)
    }

    fn per_asset_config() -> BacktestConfig {
        BacktestConfig {
            rebalance_mode: RebalanceMode::PerAsset,
            drift_threshold: 0.05,
            ..quick_config()
        }
    }

    #[test]
    fn test_drifted_assets() {
        let current = [0.30, 0.45, 0.25];
        let target = [0.20, 0.45, 0.35];
        assert_eq!(drifted_assets(&current, &target, 0.05), vec![0, 2]);
        assert!(drifted_assets(&current, &target, 0.10).is_empty());
    }

    #[test]
    fn test_per_asset_mode_trades_only_drifted_assets() {
        let (prices, jump) = jumped_prices(120);
        let mut engine = BacktestEngine::new(per_asset_config(), &prices).unwrap();
        for day in 30..jump {
            engine.step(day).unwrap();
        }
        assert_eq!(engine.state(), EngineState::Tracking);

        let target = engine.drift_monitor().baseline().unwrap().to_vec();
        let expected = drifted_assets(&engine.portfolio().weights(prices.row(jump)), &target, 0.05);
        assert!(expected.contains(&0));
        let shares_before = engine.portfolio().shares().to_vec();
        let trades_before = engine.portfolio().trade_count();

        engine.step(jump).unwrap();

        let new_trades = &engine.portfolio().trades()[trades_before..];
        assert!(new_trades.iter().any(|t| t.asset == prices.assets()[0]));
        for (i, asset) in prices.assets().iter().enumerate() {
            if !expected.contains(&i) {
                assert!(new_trades.iter().all(|t| &t.asset != asset));
                assert_eq!(engine.portfolio().shares()[i], shares_before[i]);
            }
        }
        // The baseline is untouched until the next decision point.
        assert_eq!(engine.drift_monitor().baseline().unwrap(), target.as_slice());

        // The following decision point only refreshes the target.
        let next = (jump..120)
            .find(|&d| Cadence::default().is_decision_point(prices.dates(), d))
            .unwrap();
        for day in jump + 1..next {
            engine.step(day).unwrap();
        }
        let trades_before = engine.portfolio().trade_count();
        engine.step(next).unwrap();
        assert_eq!(engine.portfolio().trade_count(), trades_before);
    }

    #[test]
    fn test_per_asset_mode_counters() {
        let (prices, _) = jumped_prices(150);
        let result = run_backtest(&prices, per_asset_config()).unwrap();

        assert_eq!(result.rebalances_executed, 1);
        assert!(result.partial_rebalances >= 1);
        assert_eq!(
            result.rebalances_executed + result.rebalances_skipped + result.windows_rejected,
            result.decision_points
        );
        assert_eq!(
            result.weight_history.len(),
            result.decision_points - result.windows_rejected
        );

        let first = result.weight_history[0].date;
        for trade in &result.trades {
            let day = prices.dates().iter().position(|d| *d == trade.date).unwrap();
            let decision = Cadence::default().is_decision_point(prices.dates(), day);
            assert!(!decision || trade.date == first, "trade on decision day {}", trade.date);
        }
    }

    #[test]
    fn test_sweep_runs_each_config() {
        let prices = synthetic_prices(120);
        let configs = vec![
            quick_config(),
            BacktestConfig {
                drift_threshold: 0.0,
                ..quick_config()
            },
            BacktestConfig {
                lookback: 1,
                ..quick_config()
            },
        ];
        let results = sweep(&prices, configs);
        assert_eq!(results.len(), 2);
        for (config, result) in &results {
            let single = run_backtest(&prices, config.clone()).unwrap();
            assert_eq!(single.fingerprint, result.fingerprint);
        }
    }
}
