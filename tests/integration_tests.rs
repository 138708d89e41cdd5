//! Integration tests for the backtest engine.

use allweather::config::BacktestFileConfig;
use allweather::covariance::CovarianceEstimator;
use allweather::crisis::{defensive_weights, CrisisConfig};
use allweather::data::{load_price_csv, PriceCsvConfig, PriceSeries};
use allweather::analytics::attribution::ContributionTable;
use allweather::engine::{
    run_backtest, sweep, BacktestConfig, BacktestEngine, Cadence, RebalanceMode,
};
use allweather::optimizer::{AllocationConstraints, GroupBound, OptimizerConfig};
use allweather::portfolio::CostModel;
use allweather::vol_target::VolatilityTargeter;
use chrono::{Datelike, NaiveDate};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::io::Write;
use tempfile::NamedTempFile;

const ASSETS: [&str; 7] = ["EQ_LARGE", "EQ_MID", "EQ_GROWTH", "BOND_GOV", "BOND_CORP", "GOLD", "COMMOD"];
const DRIFTS: [f64; 7] = [0.0004, 0.0005, 0.0006, 0.0001, 0.00012, 0.0002, 0.0001];
const VOLS: [f64; 7] = [0.012, 0.015, 0.019, 0.003, 0.004, 0.009, 0.013];
const EQUITY_BETA: [f64; 7] = [1.0, 1.1, 1.3, -0.1, 0.1, 0.0, 0.3];

fn business_days(n: usize) -> Vec<NaiveDate> {
    NaiveDate::from_ymd_opt(2018, 1, 1)
        .unwrap()
        .iter_days()
        .filter(|d| d.weekday().num_days_from_monday() < 5)
        .take(n)
        .collect()
}

fn normal(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.gen_range(1e-12..1.0);
    let u2: f64 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()
}

/// Seven correlated assets driven by a common equity factor.
fn create_universe(days: usize, seed: u64) -> PriceSeries {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut prices = vec![100.0, 60.0, 40.0, 100.0, 105.0, 30.0, 20.0];
    let mut rows = Vec::with_capacity(days);

    for _ in 0..days {
        rows.push(prices.clone());
        let factor = normal(&mut rng) * 0.008;
        for i in 0..ASSETS.len() {
            let r = DRIFTS[i] + EQUITY_BETA[i] * factor + VOLS[i] * normal(&mut rng);
            prices[i] *= 1.0 + r;
        }
    }

    PriceSeries::new(
        ASSETS.iter().map(|s| s.to_string()).collect(),
        business_days(days),
        rows,
    )
    .unwrap()
}

/// Stocks rally, then fall 40% over 40 days while bonds and gold hold up.
fn create_crash_series(days: usize, crash_start: usize) -> PriceSeries {
    let mut rng = StdRng::seed_from_u64(11);
    let mut stock = 100.0;
    let mut bond = 100.0;
    let mut gold = 50.0;
    let mut rows = Vec::with_capacity(days);

    for t in 0..days {
        rows.push(vec![stock, bond, gold]);
        let stock_r = if (crash_start..crash_start + 40).contains(&t) {
            -0.0125
        } else {
            0.0005 + 0.004 * normal(&mut rng)
        };
        stock *= 1.0 + stock_r;
        bond *= 1.0 + 0.0001 + 0.002 * normal(&mut rng);
        gold *= 1.0 + 0.0002 + 0.006 * normal(&mut rng);
    }

    PriceSeries::new(
        vec!["STK".to_string(), "BND".to_string(), "GLD".to_string()],
        business_days(days),
        rows,
    )
    .unwrap()
}

fn reference_config() -> BacktestConfig {
    BacktestConfig {
        initial_capital: 1_000_000.0,
        cost_model: CostModel::new(0.0003),
        lookback: 252,
        cadence: Cadence::default(),
        drift_threshold: 0.05,
        optimizer: OptimizerConfig {
            covariance: CovarianceEstimator::shrinkage(),
            ..OptimizerConfig::default()
        },
        ..BacktestConfig::default()
    }
}

#[test]
fn test_full_backtest_is_deterministic() {
    let prices = create_universe(400, 42);

    let first = run_backtest(&prices, reference_config()).unwrap();
    let second = run_backtest(&prices, reference_config()).unwrap();

    assert_eq!(first.equity_curve, second.equity_curve);
    assert_eq!(first.trades, second.trades);
    assert_eq!(first.final_value.to_bits(), second.final_value.to_bits());
    assert_eq!(first.fingerprint, second.fingerprint);

    assert_eq!(first.equity_curve.len(), 400 - 252);
    assert!(first.rebalances_executed >= 1);
    assert!(first.trade_count > 0);
    assert!(first.total_commissions > 0.0);
}

#[test]
fn test_weight_history_is_valid_allocation() {
    let prices = create_universe(360, 7);
    let result = run_backtest(&prices, reference_config()).unwrap();

    for snapshot in &result.weight_history {
        let total: f64 = snapshot.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-3, "weights sum to {}", total);
        assert!(snapshot.weights.values().all(|&w| w >= 0.0));
        assert_eq!(snapshot.weights.len(), ASSETS.len());
    }
}

#[test]
fn test_no_look_ahead() {
    let prices = create_universe(380, 3);
    let cut = 330;

    let full = run_backtest(&prices, reference_config()).unwrap();
    let truncated = run_backtest(&prices.truncated(cut), reference_config()).unwrap();

    let prefix = truncated.equity_curve.len();
    assert_eq!(prefix, cut - 252);
    assert_eq!(&full.equity_curve[..prefix], &truncated.equity_curve[..]);

    let last_date = prices.date(cut - 1);
    let full_trades: Vec<_> = full.trades.iter().filter(|t| t.date <= last_date).cloned().collect();
    assert_eq!(full_trades, truncated.trades);
}

#[test]
fn test_drift_threshold_reduces_trading() {
    let prices = create_universe(420, 5);

    let always = run_backtest(
        &prices,
        BacktestConfig {
            drift_threshold: 0.0,
            ..reference_config()
        },
    )
    .unwrap();
    let adaptive = run_backtest(
        &prices,
        BacktestConfig {
            drift_threshold: 0.10,
            ..reference_config()
        },
    )
    .unwrap();

    assert_eq!(always.rebalances_skipped, 0);
    assert_eq!(always.decision_points, adaptive.decision_points);
    assert!(adaptive.rebalances_executed <= always.rebalances_executed);
    assert!(adaptive.rebalances_executed >= 1);
}

#[test]
fn test_crisis_overrides_allocation() {
    let prices = create_crash_series(320, 200);
    let crisis = CrisisConfig {
        vol_window: 10,
        vol_average_window: 30,
        momentum_window: 20,
        ..CrisisConfig::default()
    }
    .with_equities(["STK"])
    .with_benchmark("STK")
    .with_defensive(["BND"], ["GLD"]);

    let config = BacktestConfig {
        lookback: 60,
        lot_size: 10,
        crisis: Some(crisis.clone()),
        ..reference_config()
    };
    let result = run_backtest(&prices, config).unwrap();

    assert!(!result.crisis_entries.is_empty());
    assert!(result.crisis_entries[0] >= prices.date(200));
    assert!(!result.crisis_days.is_empty());

    let defensive: Vec<_> = result.weight_history.iter().filter(|s| s.defensive).collect();
    assert!(!defensive.is_empty());

    let expected = defensive_weights(&crisis, prices.assets());
    let snapshot = defensive[0];
    assert!((snapshot.weights["STK"] - expected[0]).abs() < 1e-12);
    assert!((snapshot.weights["BND"] - 0.7).abs() < 1e-9);
    assert!((snapshot.weights["GLD"] - 0.3).abs() < 1e-9);
    assert_eq!(snapshot.weights["STK"], 0.0);
}

#[test]
fn test_constrained_backtest() {
    let prices = create_universe(700, 42);
    let stocks = ["EQ_LARGE", "EQ_MID", "EQ_GROWTH"];
    let bonds = ["BOND_GOV", "BOND_CORP"];

    let config = BacktestConfig {
        constraints: AllocationConstraints::equity_tilted(stocks, bonds),
        ..reference_config()
    };
    let result = run_backtest(&prices, config).unwrap();

    assert_eq!(result.optimizer_fallbacks, 0);
    assert!(!result.weight_history.is_empty());
    for snapshot in &result.weight_history {
        let equities: f64 = stocks.iter().map(|a| snapshot.weights[*a]).sum();
        let fixed_income: f64 = bonds.iter().map(|a| snapshot.weights[*a]).sum();
        assert!(equities >= 0.60 - 1e-3, "{}: stocks at {:.4}", snapshot.date, equities);
        assert!(fixed_income <= 0.35 + 1e-3, "{}: bonds at {:.4}", snapshot.date, fixed_income);
    }
}

#[test]
fn test_single_asset_cap_respected() {
    let prices = create_universe(320, 9);
    let constraints = AllocationConstraints::none()
        .with_min_group(GroupBound::new(["EQ_LARGE", "EQ_MID", "EQ_GROWTH"], 0.40))
        .with_max_single_asset(0.35);

    let config = BacktestConfig {
        constraints,
        ..reference_config()
    };
    let result = run_backtest(&prices, config).unwrap();

    assert_eq!(result.optimizer_fallbacks, 0);
    for snapshot in &result.weight_history {
        let equities: f64 = ["EQ_LARGE", "EQ_MID", "EQ_GROWTH"]
            .iter()
            .map(|a| snapshot.weights[*a])
            .sum();
        assert!(equities >= 0.40 - 1e-3);
        assert!(snapshot.weights.values().all(|&w| w <= 0.35 + 1e-3));
    }
}

#[test]
fn test_per_asset_mode_backtest() {
    let prices = create_universe(500, 8);
    let config = BacktestConfig {
        rebalance_mode: RebalanceMode::PerAsset,
        drift_threshold: 0.02,
        ..reference_config()
    };
    let result = run_backtest(&prices, config).unwrap();

    assert_eq!(result.rebalances_executed, 1);
    assert_eq!(
        result.rebalances_executed + result.rebalances_skipped + result.windows_rejected,
        result.decision_points
    );
    // Every decision point adopts a target.
    assert_eq!(
        result.weight_history.len(),
        result.decision_points - result.windows_rejected
    );
    let whole = run_backtest(&prices, reference_config()).unwrap();
    assert_eq!(whole.partial_rebalances, 0);
    assert_eq!(whole.decision_points, result.decision_points);
}

#[test]
fn test_attribution_explains_backtest_return() {
    let prices = create_universe(400, 42);
    let config = BacktestConfig {
        drift_threshold: 0.0,
        cost_model: CostModel::new(0.0),
        ..reference_config()
    };
    let result = run_backtest(&prices, config).unwrap();
    let table = ContributionTable::from_weight_history(&prices, &result.weight_history);

    assert_eq!(table.assets.len(), ASSETS.len());
    assert!(!table.is_empty());

    // Summed daily contributions track the simple-return sum of the
    // portfolio after the first target, up to lot rounding and drift.
    let first = result.weight_history[0].date;
    let start = result.equity_curve.iter().position(|p| p.date == first).unwrap();
    let realized: f64 = result.returns[start..].iter().sum();
    let attributed: f64 = table.daily_totals().iter().sum();
    assert!((realized - attributed).abs() < 0.02, "{} vs {}", realized, attributed);
}

#[test]
fn test_unknown_constraint_asset_rejected() {
    let prices = create_universe(300, 1);
    let config = BacktestConfig {
        constraints: AllocationConstraints::none().with_min_group(GroupBound::new(["MISSING"], 0.2)),
        ..reference_config()
    };
    assert!(BacktestEngine::new(config, &prices).is_err());
}

#[test]
fn test_volatility_target_holds_cash() {
    let prices = create_universe(400, 21);
    let config = BacktestConfig {
        vol_target: Some(VolatilityTargeter::new(0.005)),
        drift_threshold: 0.0,
        ..reference_config()
    };
    let result = run_backtest(&prices, config).unwrap();

    // Scaled-down targets leave part of the portfolio in cash.
    let scaled = result
        .weight_history
        .iter()
        .any(|s| s.weights.values().sum::<f64>() < 0.99);
    assert!(scaled);
}

#[test]
fn test_backtest_from_csv() {
    let prices = create_universe(300, 17);
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "date,{}", ASSETS.join(",")).unwrap();
    for day in 0..prices.len() {
        let row: Vec<String> = prices.row(day).iter().map(|p| format!("{:.6}", p)).collect();
        writeln!(file, "{},{}", prices.date(day), row.join(",")).unwrap();
    }
    file.flush().unwrap();

    let loaded = load_price_csv(file.path(), &PriceCsvConfig::default()).unwrap();
    assert_eq!(loaded.len(), 300);
    assert_eq!(loaded.assets(), prices.assets());

    let config = BacktestConfig {
        lookback: 120,
        ..reference_config()
    };
    let result = run_backtest(&loaded, config).unwrap();
    assert_eq!(result.equity_curve.len(), 180);
    assert!(result.rebalances_executed >= 1);
}

#[test]
fn test_file_config_runs() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[backtest]
lookback = 100
rebalance = "monthly"
drift_threshold = 0.03

[optimizer]
shrinkage = true
"#
    )
    .unwrap();

    let config = BacktestFileConfig::load(file.path())
        .unwrap()
        .to_backtest_config()
        .unwrap();
    let prices = create_universe(260, 2);
    let result = run_backtest(&prices, config).unwrap();

    assert_eq!(result.equity_curve.len(), 160);
    // Monthly over ~8 months.
    assert!(result.decision_points >= 7 && result.decision_points <= 9);
}

#[test]
fn test_parallel_sweep_matches_sequential() {
    let prices = create_universe(330, 13);
    let configs: Vec<BacktestConfig> = [0.0, 0.05, 0.10]
        .iter()
        .map(|&t| BacktestConfig {
            drift_threshold: t,
            ..reference_config()
        })
        .collect();

    let results = sweep(&prices, configs);
    assert_eq!(results.len(), 3);

    for (config, result) in &results {
        let sequential = run_backtest(&prices, config.clone()).unwrap();
        assert_eq!(sequential.equity_curve, result.equity_curve);
        assert_eq!(sequential.fingerprint, result.fingerprint);
    }
}
