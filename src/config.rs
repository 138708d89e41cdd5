//! Configuration file support for backtests.
//!
//! Allows loading backtest configurations from TOML files for reproducibility.

use crate::covariance::CovarianceEstimator;
use crate::crisis::CrisisConfig;
use crate::data::PriceCsvConfig;
use crate::engine::{BacktestConfig, Cadence, RebalanceMode};
use crate::environment::EnvironmentMap;
use crate::error::{BacktestError, Result};
use crate::optimizer::{AllocationConstraints, GroupBound, OptimizerConfig};
use crate::portfolio::CostModel;
use crate::vol_target::VolatilityTargeter;
use chrono::Weekday;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

/// Complete backtest configuration loaded from a file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestFileConfig {
    /// General backtest settings.
    #[serde(default)]
    pub backtest: BacktestSettings,
    /// Data settings.
    #[serde(default)]
    pub data: DataSettings,
    /// Cost model settings.
    #[serde(default)]
    pub costs: CostSettings,
    #[serde(default)]
    pub optimizer: OptimizerSettings,
    #[serde(default)]
    pub constraints: ConstraintSettings,
    /// Per-asset lot size overrides.
    #[serde(default)]
    pub lots: BTreeMap<String, i64>,
    /// Asset to macro environment labels.
    #[serde(default)]
    pub environments: EnvironmentMap,
    /// Crisis overlay; enabled when the section is present.
    #[serde(default)]
    pub crisis: Option<CrisisConfig>,
    /// Volatility targeting; enabled when the section is present.
    #[serde(default)]
    pub vol_target: Option<VolatilityTargeter>,
}

/// General backtest settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestSettings {
    #[serde(default = "default_capital")]
    pub initial_capital: f64,
    /// Prices per covariance window.
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    /// "daily", "weekly" or "monthly".
    #[serde(default = "default_rebalance")]
    pub rebalance: String,
    /// Weekday for weekly rebalancing.
    #[serde(default = "default_weekday")]
    pub weekday: String,
    /// Max weight drift before trading; 0 always rebalances.
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: f64,
    /// "portfolio" or "per_asset".
    #[serde(default)]
    pub rebalance_mode: RebalanceMode,
    #[serde(default = "default_min_trade_value")]
    pub min_trade_value: f64,
    #[serde(default = "default_lot_size")]
    pub lot_size: i64,
    #[serde(default)]
    pub start_index: Option<usize>,
    #[serde(default)]
    pub end_index: Option<usize>,
    /// Risk-free rate for reported ratios.
    #[serde(default = "default_risk_free_rate")]
    pub risk_free_rate: f64,
}

fn default_capital() -> f64 { 1_000_000.0 }
fn default_lookback() -> usize { 252 }
fn default_rebalance() -> String { "weekly".to_string() }
fn default_weekday() -> String { "mon".to_string() }
fn default_drift_threshold() -> f64 { 0.05 }
fn default_min_trade_value() -> f64 { 100.0 }
fn default_lot_size() -> i64 { 100 }
fn default_risk_free_rate() -> f64 { 0.03 }
fn default_true() -> bool { true }

impl Default for BacktestSettings {
    fn default() -> Self {
        Self {
            initial_capital: default_capital(),
            lookback: default_lookback(),
            rebalance: default_rebalance(),
            weekday: default_weekday(),
            drift_threshold: default_drift_threshold(),
            rebalance_mode: RebalanceMode::default(),
            min_trade_value: default_min_trade_value(),
            lot_size: default_lot_size(),
            start_index: None,
            end_index: None,
            risk_free_rate: default_risk_free_rate(),
        }
    }
}

/// Price data settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSettings {
    /// Path to the wide price CSV.
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub date_format: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Restrict the universe to these columns.
    #[serde(default)]
    pub assets: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub drop_incomplete_rows: bool,
}

fn default_path() -> String { "data/prices.csv".to_string() }
fn default_delimiter() -> char { ',' }

impl Default for DataSettings {
    fn default() -> Self {
        Self {
            path: default_path(),
            date_format: None,
            delimiter: default_delimiter(),
            assets: None,
            drop_incomplete_rows: true,
        }
    }
}

impl DataSettings {
    pub fn to_csv_config(&self) -> Result<PriceCsvConfig> {
        if !self.delimiter.is_ascii() {
            return Err(BacktestError::ConfigError(format!(
                "Delimiter must be ASCII, got {:?}",
                self.delimiter
            )));
        }
        Ok(PriceCsvConfig {
            date_format: self.date_format.clone(),
            delimiter: self.delimiter as u8,
            drop_incomplete_rows: self.drop_incomplete_rows,
            assets: self.assets.clone(),
        })
    }
}

/// Cost model settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSettings {
    /// Commission as a fraction of traded value.
    #[serde(default = "default_commission_rate")]
    pub commission_rate: f64,
    #[serde(default)]
    pub min_commission: f64,
}

fn default_commission_rate() -> f64 { 0.0003 }

impl Default for CostSettings {
    fn default() -> Self {
        Self {
            commission_rate: default_commission_rate(),
            min_commission: 0.0,
        }
    }
}

/// Optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Shrink the sample covariance towards constant correlation.
    #[serde(default = "default_true")]
    pub shrinkage: bool,
    /// Eigenvalue floor for the covariance, off when unset.
    #[serde(default)]
    pub psd_floor: Option<f64>,
    /// λ on the negative Sharpe ratio.
    #[serde(default)]
    pub sharpe_weight: f64,
    /// β on the environment imbalance penalty.
    #[serde(default)]
    pub environment_weight: f64,
    #[serde(default = "default_ewma_span")]
    pub ewma_span: usize,
    #[serde(default)]
    pub risk_free_rate: f64,
    #[serde(default = "default_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_ftol")]
    pub ftol: f64,
}

fn default_ewma_span() -> usize { 252 }
fn default_max_iter() -> usize { 1000 }
fn default_ftol() -> f64 { 1e-9 }

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            shrinkage: true,
            psd_floor: None,
            sharpe_weight: 0.0,
            environment_weight: 0.0,
            ewma_span: default_ewma_span(),
            risk_free_rate: 0.0,
            max_iter: default_max_iter(),
            ftol: default_ftol(),
        }
    }
}

impl OptimizerSettings {
    fn to_optimizer_config(&self) -> OptimizerConfig {
        let mut covariance = if self.shrinkage {
            CovarianceEstimator::shrinkage()
        } else {
            CovarianceEstimator::sample()
        };
        covariance.psd_floor = self.psd_floor;

        OptimizerConfig {
            max_iter: self.max_iter,
            ftol: self.ftol,
            sharpe_weight: self.sharpe_weight,
            environment_weight: self.environment_weight,
            ewma_span: self.ewma_span,
            risk_free_rate: self.risk_free_rate,
            covariance,
        }
    }
}

/// Allocation bound settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConstraintSettings {
    #[serde(default)]
    pub min_group_assets: Vec<String>,
    /// Lower bound on the combined weight of `min_group_assets`.
    #[serde(default)]
    pub min_group_weight: Option<f64>,
    #[serde(default)]
    pub max_group_assets: Vec<String>,
    /// Upper bound on the combined weight of `max_group_assets`.
    #[serde(default)]
    pub max_group_weight: Option<f64>,
    #[serde(default)]
    pub max_single_asset: Option<f64>,
}

impl ConstraintSettings {
    fn to_constraints(&self) -> Result<AllocationConstraints> {
        let group = |name: &str, assets: &[String], weight: Option<f64>| match (assets.is_empty(), weight) {
            (true, None) => Ok(None),
            (false, Some(limit)) => Ok(Some(GroupBound::new(assets.iter().cloned(), limit))),
            _ => Err(BacktestError::ConfigError(format!(
                "{}_group_assets and {}_group_weight must be given together",
                name, name
            ))),
        };

        Ok(AllocationConstraints {
            min_group: group("min", &self.min_group_assets, self.min_group_weight)?,
            max_group: group("max", &self.max_group_assets, self.max_group_weight)?,
            max_single_asset: self.max_single_asset,
        })
    }
}

/// Parse a cadence name and weekday.
pub fn parse_cadence(rebalance: &str, weekday: &str) -> Result<Cadence> {
    match rebalance.trim().to_lowercase().as_str() {
        "daily" => Ok(Cadence::Daily),
        "monthly" => Ok(Cadence::Monthly),
        "weekly" => weekday
            .trim()
            .parse::<Weekday>()
            .map(Cadence::Weekly)
            .map_err(|_| BacktestError::ConfigError(format!("Unknown weekday: {}", weekday))),
        other => Err(BacktestError::ConfigError(format!(
            "Unknown rebalance cadence: {}",
            other
        ))),
    }
}

impl BacktestFileConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = fs::read_to_string(path)?;
        let config: BacktestFileConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BacktestError::ConfigError(e.to_string()))?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Convert to engine configuration.
    pub fn to_backtest_config(&self) -> Result<BacktestConfig> {
        let b = &self.backtest;
        Ok(BacktestConfig {
            initial_capital: b.initial_capital,
            cost_model: CostModel {
                commission_rate: self.costs.commission_rate,
                min_commission: self.costs.min_commission,
            },
            lot_size: b.lot_size,
            lot_sizes: self.lots.clone(),
            min_trade_value: b.min_trade_value,
            lookback: b.lookback,
            cadence: parse_cadence(&b.rebalance, &b.weekday)?,
            drift_threshold: b.drift_threshold,
            rebalance_mode: b.rebalance_mode,
            optimizer: self.optimizer.to_optimizer_config(),
            constraints: self.constraints.to_constraints()?,
            environments: self.environments.clone(),
            crisis: self.crisis.clone(),
            vol_target: self.vol_target,
            start_index: b.start_index,
            end_index: b.end_index,
            metrics_risk_free_rate: b.risk_free_rate,
            show_progress: false,
        })
    }

    /// Generate an example configuration file.
    pub fn example() -> String {
        r#"# All Weather Backtest Configuration File
# This file configures a risk-parity backtest run

[backtest]
initial_capital = 1000000.0
lookback = 252            # prices per covariance window
rebalance = "weekly"      # daily | weekly | monthly
weekday = "mon"
drift_threshold = 0.05    # 0 = always rebalance
rebalance_mode = "portfolio"  # portfolio | per_asset
min_trade_value = 100.0
lot_size = 100
risk_free_rate = 0.03
# start_index = 252
# end_index = 1000

[data]
path = "data/prices.csv"
# date_format = "%Y-%m-%d"
delimiter = ","
# assets = ["510300.SH", "511260.SH", "518880.SH"]

[costs]
commission_rate = 0.0003  # 0.03%
min_commission = 0.0

[optimizer]
shrinkage = true
# psd_floor = 1e-10
sharpe_weight = 0.0       # return-aware when > 0
environment_weight = 0.0  # environment balance when > 0
ewma_span = 252

# [constraints]
# min_group_assets = ["510300.SH", "510500.SH"]
# min_group_weight = 0.60
# max_group_assets = ["511260.SH"]
# max_group_weight = 0.35
# max_single_asset = 0.35

# [lots]
# "511260.SH" = 10

# [environments]
# "510300.SH" = "growth_rising"
# "511260.SH" = "growth_falling"
# "518880.SH" = "inflation_rising"

# [crisis]
# equity_assets = ["510300.SH"]
# benchmark = "510300.SH"
# bond_assets = ["511260.SH"]
# hedge_assets = ["518880.SH"]
# vote_threshold = 2

# [vol_target]
# target_vol = 0.10
# window = 60
# max_leverage = 1.0
"#
        .to_string()
    }
}
