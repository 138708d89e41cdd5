//! Command-line interface for the backtest engine.

use allweather::analytics::attribution::ContributionTable;
use allweather::analytics::ResultFormatter;
use allweather::config::BacktestFileConfig;
use allweather::covariance::CovarianceEstimator;
use allweather::crisis::CrisisConfig;
use allweather::data::{load_price_csv, PriceCsvConfig, PriceSeries};
use allweather::engine::{run_backtest, sweep, BacktestConfig, Cadence, RebalanceMode};
use allweather::error::Result;
use allweather::metadata::track_data_file;
use allweather::optimizer::OptimizerConfig;
use allweather::portfolio::CostModel;
use allweather::vol_target::VolatilityTargeter;

use chrono::Weekday;
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// All Weather - risk-parity allocation with adaptive rebalancing.
#[derive(Parser)]
#[command(name = "allweather")]
#[command(version)]
#[command(about = "Risk-parity portfolio backtests with drift-based rebalancing")]
#[command(long_about = None)]
pub struct Cli {
    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a backtest on a wide price CSV
    Run {
        /// Path to price file (date column plus one column per asset)
        #[arg(short, long)]
        data: PathBuf,

        /// Restrict the universe to these assets
        #[arg(short, long, value_delimiter = ',')]
        assets: Option<Vec<String>>,

        /// Initial capital
        #[arg(short, long, default_value = "1000000")]
        capital: f64,

        /// Prices per covariance window
        #[arg(short, long, default_value = "252")]
        lookback: usize,

        /// Commission as a fraction of traded value
        #[arg(long, default_value = "0.0003")]
        commission: f64,

        /// Max weight drift before rebalancing (0 = always)
        #[arg(short, long, default_value = "0.05")]
        threshold: f64,

        /// Rebalance cadence
        #[arg(long, value_enum, default_value = "weekly")]
        cadence: CadenceArg,

        /// Trade the whole portfolio or only drifted assets
        #[arg(long, value_enum, default_value = "portfolio")]
        mode: ModeArg,

        /// Shares per lot
        #[arg(long, default_value = "100")]
        lot_size: i64,

        /// Use the sample covariance without shrinkage
        #[arg(long)]
        no_shrinkage: bool,

        /// Annualized volatility target
        #[arg(long)]
        target_vol: Option<f64>,

        /// Equities watched by the crisis overlay (enables it)
        #[arg(long, value_delimiter = ',')]
        crisis_equities: Option<Vec<String>>,

        /// Defensive bond assets
        #[arg(long, value_delimiter = ',')]
        bonds: Vec<String>,

        /// Defensive hedge assets
        #[arg(long, value_delimiter = ',')]
        hedges: Vec<String>,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Run a backtest from a configuration file
    RunConfig {
        /// Path to TOML configuration file
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Compare drift thresholds in parallel
    Sweep {
        /// Path to price file
        #[arg(short, long)]
        data: PathBuf,

        /// Drift thresholds to compare
        #[arg(short, long, value_delimiter = ',', default_value = "0,0.02,0.05,0.1")]
        thresholds: Vec<f64>,

        /// Prices per covariance window
        #[arg(short, long, default_value = "252")]
        lookback: usize,
    },

    /// Generate an example configuration file
    ExampleConfig {
        /// Output path for config file
        #[arg(short, long, default_value = "allweather.toml")]
        output: PathBuf,
    },

    /// Validate a price file
    Validate {
        /// Path to price file
        #[arg(short, long)]
        data: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum CadenceArg {
    Daily,
    Weekly,
    Monthly,
}

impl From<CadenceArg> for Cadence {
    fn from(arg: CadenceArg) -> Self {
        match arg {
            CadenceArg::Daily => Cadence::Daily,
            CadenceArg::Weekly => Cadence::Weekly(Weekday::Mon),
            CadenceArg::Monthly => Cadence::Monthly,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    Portfolio,
    PerAsset,
}

impl From<ModeArg> for RebalanceMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Portfolio => RebalanceMode::Portfolio,
            ModeArg::PerAsset => RebalanceMode::PerAsset,
        }
    }
}

impl Cli {
    /// Initialize logging based on verbosity level.
    pub fn init_logging(&self) {
        let level = match self.verbose {
            0 => Level::WARN,
            1 => Level::INFO,
            2 => Level::DEBUG,
            _ => Level::TRACE,
        };

        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(false)
            .finish();

        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {}", e);
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

/// Run the CLI application.
pub fn run() -> Result<()> {
    let cli = Cli::parse();
    cli.init_logging();

    match &cli.command {
        Commands::Run {
            data,
            assets,
            capital,
            lookback,
            commission,
            threshold,
            cadence,
            mode,
            lot_size,
            no_shrinkage,
            target_vol,
            crisis_equities,
            bonds,
            hedges,
            progress,
        } => {
            let prices = load_prices(data, assets.clone())?;
            let covariance = if *no_shrinkage {
                CovarianceEstimator::sample()
            } else {
                CovarianceEstimator::shrinkage()
            };
            let crisis = crisis_equities.as_ref().map(|equities| {
                CrisisConfig::default()
                    .with_equities(equities.iter().cloned())
                    .with_benchmark(equities.first().cloned().unwrap_or_default())
                    .with_defensive(bonds.iter().cloned(), hedges.iter().cloned())
            });

            let config = BacktestConfig {
                initial_capital: *capital,
                cost_model: CostModel::new(*commission),
                lot_size: *lot_size,
                lookback: *lookback,
                cadence: (*cadence).into(),
                drift_threshold: *threshold,
                rebalance_mode: (*mode).into(),
                optimizer: OptimizerConfig {
                    covariance,
                    ..OptimizerConfig::default()
                },
                crisis,
                vol_target: target_vol.map(VolatilityTargeter::new),
                show_progress: *progress,
                ..BacktestConfig::default()
            };
            report(&prices, config, cli.output)
        }

        Commands::RunConfig { config } => run_from_config(config, cli.output),

        Commands::Sweep {
            data,
            thresholds,
            lookback,
        } => run_sweep(data, thresholds, *lookback, cli.output),

        Commands::ExampleConfig { output } => init_config(output),

        Commands::Validate { data } => validate_data(data),
    }
}

fn load_prices(path: &Path, assets: Option<Vec<String>>) -> Result<PriceSeries> {
    let config = PriceCsvConfig {
        assets,
        ..PriceCsvConfig::default()
    };
    load_price_csv(path, &config)
}

fn report(prices: &PriceSeries, config: BacktestConfig, output: OutputFormat) -> Result<()> {
    let result = run_backtest(prices, config)?;

    match output {
        OutputFormat::Text => {
            ResultFormatter::print_report(&result);
            let attribution = ContributionTable::from_weight_history(prices, &result.weight_history);
            if !attribution.is_empty() {
                ResultFormatter::print_attribution(&attribution);
            }
        }
        OutputFormat::Json => println!("{}", ResultFormatter::to_json(&result)),
    }
    Ok(())
}

fn run_from_config(config_path: &Path, output: OutputFormat) -> Result<()> {
    let file_config = BacktestFileConfig::load(config_path)?;
    let backtest_config = file_config.to_backtest_config()?;

    info!("Loading data from: {}", file_config.data.path);
    let prices = load_price_csv(&file_config.data.path, &file_config.data.to_csv_config()?)?;

    report(&prices, backtest_config, output)
}

fn run_sweep(data: &Path, thresholds: &[f64], lookback: usize, output: OutputFormat) -> Result<()> {
    let prices = load_prices(data, None)?;
    let configs: Vec<BacktestConfig> = thresholds
        .iter()
        .map(|&t| BacktestConfig {
            drift_threshold: t,
            lookback,
            optimizer: OptimizerConfig {
                covariance: CovarianceEstimator::shrinkage(),
                ..OptimizerConfig::default()
            },
            ..BacktestConfig::default()
        })
        .collect();

    let mut results = sweep(&prices, configs);
    results.sort_by(|a, b| a.0.drift_threshold.total_cmp(&b.0.drift_threshold));

    match output {
        OutputFormat::Text => {
            let labelled: Vec<(String, _)> = results
                .into_iter()
                .map(|(config, result)| (format!("drift {:.2}", config.drift_threshold), result))
                .collect();
            ResultFormatter::print_table(&labelled);
        }
        OutputFormat::Json => {
            for (_, result) in &results {
                println!("{}", ResultFormatter::to_json(result));
            }
        }
    }
    Ok(())
}

fn init_config(output: &Path) -> Result<()> {
    let example = BacktestFileConfig::example();
    fs::write(output, example)?;
    println!("Created example configuration file: {}", output.display());
    println!("\nEdit this file to customize your backtest, then run:");
    println!("  allweather run-config -c {}", output.display());
    Ok(())
}

fn validate_data(data_path: &Path) -> Result<()> {
    println!("Validating price file: {}", data_path.display());

    let prices = load_prices(data_path, None)?;
    let metadata = track_data_file(data_path)?;

    println!("\nData Summary:");
    println!("  Assets: {}", prices.assets().join(", "));
    println!("  Rows: {}", prices.len());
    if let (Some(first), Some(last)) = (prices.dates().first(), prices.dates().last()) {
        println!("  Start: {}", first);
        println!("  End: {}", last);
    }
    println!("  Size: {} bytes", metadata.size);
    println!("  SHA256: {}", metadata.checksum);

    for (i, asset) in prices.assets().iter().enumerate() {
        let invalid = prices
            .column_iter(i, prices.len())
            .filter(|p| !(p.is_finite() && *p > 0.0))
            .count();
        if invalid > 0 {
            println!("  {} {}: {} invalid prices", "warning:".yellow(), asset, invalid);
        }
    }

    println!("\nValidation: {}", "PASSED".green());
    Ok(())
}
