//! All Weather - risk-parity portfolio construction with an adaptive,
//! cost-aware rebalancing backtest.
//!
//! # Overview
//!
//! The crate builds equal-risk-contribution weights over a small multi-asset
//! universe and simulates them day by day:
//!
//! - **Covariance estimation**: sample or constant-correlation shrinkage, with
//!   an optional eigenvalue floor
//! - **Constrained optimization**: SQP over the simplex with group bounds, a
//!   per-asset cap, a return-aware term and an environment balance penalty
//! - **Deterministic fallback**: inverse-volatility weights whenever a solve
//!   fails, reported through a tagged outcome
//! - **Crisis overlay**: three stress signals, a vote and exit hysteresis
//! - **Volatility targeting**: rescale towards a target realized volatility
//! - **Lot-rounded ledger**: integer shares in board lots with commission
//! - **Adaptive rebalancing**: trade only when drift from the last executed
//!   target exceeds a threshold, for the whole portfolio or per asset
//! - **Attribution**: per-asset and per-class return contributions, period
//!   returns and rolling metrics
//!
//! # Quick Start
//!
//! ```no_run
//! use allweather::{
//!     data::{load_price_csv, PriceCsvConfig},
//!     engine::{run_backtest, BacktestConfig},
//! };
//!
//! let prices = load_price_csv("data/prices.csv", &PriceCsvConfig::default()).unwrap();
//!
//! let config = BacktestConfig {
//!     initial_capital: 1_000_000.0,
//!     drift_threshold: 0.05,
//!     ..Default::default()
//! };
//! let result = run_backtest(&prices, config).unwrap();
//!
//! println!("Return: {:.2}%", result.total_return * 100.0);
//! println!("Sharpe: {:.2}", result.metrics.sharpe_ratio);
//! ```
//!
//! # Optimizing a single window
//!
//! ```
//! use allweather::optimizer::{OptimizerConfig, RiskParityOptimizer};
//!
//! let assets = vec!["STOCKS".to_string(), "BONDS".to_string()];
//! let cov = vec![vec![0.04, 0.0], vec![0.0, 0.01]];
//! let outcome = RiskParityOptimizer::new(OptimizerConfig::default())
//!     .optimize_with_covariance(&assets, &cov, None)
//!     .unwrap();
//!
//! let w = outcome.weights();
//! assert!((w[0] / w[1] - 0.5).abs() < 1e-2);
//! ```
//!
//! # Modules
//!
//! - [`types`]: Trade records, equity points, weight snapshots
//! - [`data`]: Price table, return windows and CSV loading
//! - [`covariance`]: Sample and shrinkage covariance
//! - [`optimizer`]: Risk-parity optimizer and weight helpers
//! - [`environment`]: Macro environment risk balance
//! - [`crisis`]: Crisis detection and defensive allocation
//! - [`vol_target`]: Realized-volatility targeting
//! - [`portfolio`]: Cash and share ledger
//! - [`engine`]: Backtest loop, drift monitor and sweeps
//! - [`analytics`]: Performance metrics, attribution and reporting
//! - [`metadata`]: Run fingerprints
//! - [`config`]: TOML configuration file support

pub mod analytics;
pub mod config;
pub mod covariance;
pub mod crisis;
pub mod data;
pub mod engine;
pub mod environment;
pub mod error;
pub mod metadata;
pub mod optimizer;
pub mod portfolio;
pub mod types;
pub mod vol_target;

// Re-exports for convenience
pub use analytics::attribution::ContributionTable;
pub use analytics::{PerformanceMetrics, ResultFormatter};
pub use config::BacktestFileConfig;
pub use covariance::{CovarianceEstimator, CovarianceMatrix, CovarianceMethod};
pub use crisis::{CrisisConfig, CrisisDetector, CrisisSignals, CrisisState};
pub use data::{load_price_csv, PriceCsvConfig, PriceSeries};
pub use engine::{
    drifted_assets, run_backtest, sweep, BacktestConfig, BacktestEngine, BacktestResult, Cadence,
    DriftMonitor, EngineState, RebalanceMode,
};
pub use environment::{Environment, EnvironmentMap};
pub use error::{BacktestError, Result};
pub use metadata::RunFingerprint;
pub use optimizer::{
    AllocationConstraints, FallbackReason, GroupBound, OptimizationOutcome, OptimizerConfig,
    RiskParityOptimizer,
};
pub use portfolio::{CostModel, Portfolio, RebalanceReport};
pub use types::{EquityPoint, Side, SkipReason, SkippedLeg, TradeRecord, WeightSnapshot};
pub use vol_target::VolatilityTargeter;
