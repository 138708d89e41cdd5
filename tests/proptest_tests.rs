//! Property-based tests using proptest for invariant testing.
//!
//! These tests verify that:
//! 1. Optimizer weights always form a valid allocation
//! 2. Shrinkage intensity stays in [0, 1] and keeps symmetry
//! 3. The ledger invariant holds after any rebalance
//! 4. Rebalancing from cash is idempotent
//! 5. Drift decisions and engine counters are consistent

use chrono::{Datelike, NaiveDate};
use proptest::prelude::*;

use allweather::covariance::shrink_to_constant_correlation;
use allweather::data::PriceSeries;
use allweather::engine::{max_drift, run_backtest, BacktestConfig, DriftMonitor};
use allweather::optimizer::{OptimizerConfig, RiskParityOptimizer};
use allweather::portfolio::{CostModel, Portfolio};

fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("A{}", i)).collect()
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()
}

// ============================================================================
// Generators
// ============================================================================

/// Covariance `L Lᵀ + εI` from a random lower-triangular factor.
fn covariance_strategy() -> impl Strategy<Value = Vec<Vec<f64>>> {
    (2..6usize).prop_flat_map(|n| {
        prop::collection::vec(-0.02..0.02f64, n * n).prop_map(move |raw| {
            let mut cov = vec![vec![0.0; n]; n];
            for i in 0..n {
                for j in 0..n {
                    let mut s = 0.0;
                    for k in 0..=i.min(j) {
                        s += raw[i * n + k] * raw[j * n + k];
                    }
                    cov[i][j] = s;
                }
                cov[i][i] += 1e-5;
            }
            cov
        })
    })
}

/// Nonnegative weights summing to one.
fn weights_strategy(n: usize) -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(0.01..1.0f64, n).prop_map(|raw| {
        let total: f64 = raw.iter().sum();
        raw.into_iter().map(|w| w / total).collect()
    })
}

fn prices_strategy(n: usize) -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(1.0..500.0f64, n)
}

// ============================================================================
// Optimizer Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn optimizer_weights_form_allocation(cov in covariance_strategy()) {
        let assets = names(cov.len());
        let outcome = RiskParityOptimizer::new(OptimizerConfig::default())
            .optimize_with_covariance(&assets, &cov, None)
            .unwrap();
        let w = outcome.weights();

        prop_assert_eq!(w.len(), assets.len());
        prop_assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-3);
        prop_assert!(w.iter().all(|&x| x >= 0.0 && x.is_finite()));
    }

    #[test]
    fn shrinkage_intensity_in_unit_interval(
        returns in prop::collection::vec(prop::collection::vec(-0.05..0.05f64, 3), 10..60)
    ) {
        let (matrix, delta) = shrink_to_constant_correlation(&returns);
        prop_assert!((0.0..=1.0).contains(&delta));
        for i in 0..3 {
            for j in 0..3 {
                prop_assert!((matrix[i][j] - matrix[j][i]).abs() < 1e-15);
            }
        }
    }
}

// ============================================================================
// Ledger Property Tests
// ============================================================================

proptest! {
    #[test]
    fn ledger_invariant_after_rebalance(
        target in weights_strategy(4),
        prices in prices_strategy(4),
        capital in 10_000.0..5_000_000.0f64,
        lot in 1..200i64,
    ) {
        let mut portfolio = Portfolio::new(names(4), capital, CostModel::default(), lot);
        let before = portfolio.value(&prices);
        let report = portfolio.rebalance(date(), &target, &prices, 0.0).unwrap();

        let marked: f64 = portfolio
            .shares()
            .iter()
            .zip(&prices)
            .map(|(&s, &p)| s as f64 * p)
            .sum();
        prop_assert!(portfolio.cash() >= 0.0);
        prop_assert!((portfolio.value(&prices) - (portfolio.cash() + marked)).abs() < 1e-6);
        // Trading at the marking price only costs commission.
        prop_assert!((before - portfolio.value(&prices) - report.commission).abs() < 1e-6 * capital.max(1.0));
        prop_assert!(portfolio.shares().iter().zip(portfolio.lot_sizes()).all(|(&s, &l)| s >= 0 && s % l == 0));
    }

    #[test]
    fn rebalance_from_cash_is_idempotent(
        target in weights_strategy(3),
        prices in prices_strategy(3),
        capital in 50_000.0..2_000_000.0f64,
    ) {
        let mut portfolio = Portfolio::new(names(3), capital, CostModel::new(0.0), 10);
        portfolio.rebalance(date(), &target, &prices, 0.0).unwrap();
        let shares = portfolio.shares().to_vec();

        let second = portfolio.rebalance(date(), &target, &prices, 0.0).unwrap();
        prop_assert!(second.trades.is_empty());
        prop_assert_eq!(portfolio.shares(), &shares[..]);
    }
}

// ============================================================================
// Drift and Engine Property Tests
// ============================================================================

proptest! {
    #[test]
    fn drift_is_symmetric_and_bounded(a in weights_strategy(5), b in weights_strategy(5)) {
        let d = max_drift(&a, &b);
        prop_assert_eq!(d, max_drift(&b, &a));
        prop_assert!((0.0..=1.0).contains(&d));
        prop_assert_eq!(max_drift(&a, &a), 0.0);
    }

    #[test]
    fn unchanged_weights_never_trigger(w in weights_strategy(4), threshold in 0.001..0.5f64) {
        let mut monitor = DriftMonitor::new(threshold);
        prop_assert!(monitor.should_rebalance(&w).0);
        monitor.set_baseline(w.clone());
        prop_assert!(!monitor.should_rebalance(&w).0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn engine_counters_are_consistent(
        threshold in 0.0..0.2f64,
        phase in 0.0..6.0f64,
    ) {
        let n = 90;
        let dates: Vec<NaiveDate> = NaiveDate::from_ymd_opt(2021, 1, 4)
            .unwrap()
            .iter_days()
            .filter(|d| d.weekday().num_days_from_monday() < 5)
            .take(n)
            .collect();
        let rows: Vec<Vec<f64>> = (0..n)
            .map(|t| {
                let t = t as f64;
                vec![
                    100.0 + 4.0 * (t * 0.3 + phase).sin(),
                    50.0 + 0.5 * (t * 0.9).cos(),
                    70.0 + 2.0 * (t * 0.17 + phase).cos(),
                ]
            })
            .collect();
        let prices = PriceSeries::new(names(3), dates, rows).unwrap();

        let config = BacktestConfig {
            lookback: 20,
            lot_size: 10,
            drift_threshold: threshold,
            ..BacktestConfig::default()
        };
        let result = run_backtest(&prices, config).unwrap();

        prop_assert_eq!(result.equity_curve.len(), n - 20);
        prop_assert_eq!(
            result.rebalances_executed + result.rebalances_skipped + result.windows_rejected,
            result.decision_points
        );
        prop_assert!(result.rebalances_executed >= 1);
        prop_assert!(result.equity_curve.iter().all(|p| p.cash >= 0.0));
    }
}
