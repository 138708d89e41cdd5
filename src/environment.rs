//! Macro-environment risk balance.
//!
//! Each asset is labelled with the economic environment it is expected to
//! perform well in. The model measures how much of the portfolio's risk each
//! environment carries and how far that is from an even split.

use crate::covariance::CovarianceMatrix;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Economic environment an asset is expected to benefit from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    GrowthRising,
    GrowthFalling,
    InflationRising,
    InflationFalling,
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Environment::GrowthRising => write!(f, "growth_rising"),
            Environment::GrowthFalling => write!(f, "growth_falling"),
            Environment::InflationRising => write!(f, "inflation_rising"),
            Environment::InflationFalling => write!(f, "inflation_falling"),
        }
    }
}

/// Static asset → environment labels.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentMap {
    labels: BTreeMap<String, Environment>,
}

impl EnvironmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_asset(mut self, asset: impl Into<String>, env: Environment) -> Self {
        self.labels.insert(asset.into(), env);
        self
    }

    pub fn insert(&mut self, asset: impl Into<String>, env: Environment) {
        self.labels.insert(asset.into(), env);
    }

    pub fn get(&self, asset: &str) -> Option<Environment> {
        self.labels.get(asset).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Environment)> {
        self.labels.iter()
    }

    /// Labels for a universe, in universe order. Unlabelled assets map to `None`.
    pub fn resolve(&self, assets: &[String]) -> Vec<Option<Environment>> {
        assets.iter().map(|a| self.get(a)).collect()
    }
}

/// Risk share carried by each environment.
///
/// The share of environment `e` is `Σ_{i∈e} w_i (Σw)_i / σ_p`, so shares add
/// up to the portfolio volatility when every asset is labelled. Unlabelled
/// assets contribute to no environment. A degenerate portfolio (σ_p ≈ 0)
/// yields zero for every environment present.
pub fn risk_by_environment(
    weights: &[f64],
    cov: &CovarianceMatrix,
    labels: &[Option<Environment>],
) -> BTreeMap<Environment, f64> {
    let n = weights.len();
    let sigma_w: Vec<f64> = (0..n)
        .map(|i| (0..n).map(|j| cov[i][j] * weights[j]).sum())
        .collect();
    let variance: f64 = weights.iter().zip(&sigma_w).map(|(w, s)| w * s).sum();
    let vol = variance.max(0.0).sqrt();

    let mut shares = BTreeMap::new();
    for (i, label) in labels.iter().enumerate().take(n) {
        if let Some(env) = label {
            let rc = if vol < 1e-10 {
                0.0
            } else {
                weights[i] * sigma_w[i] / vol
            };
            *shares.entry(*env).or_insert(0.0) += rc;
        }
    }
    shares
}

/// RMS deviation of active environment shares from an even split.
///
/// Active environments are those carrying positive risk. Returns zero when
/// none is active.
pub fn imbalance_penalty(shares: &BTreeMap<Environment, f64>) -> f64 {
    let active: Vec<f64> = shares.values().copied().filter(|&s| s > 0.0).collect();
    if active.is_empty() {
        return 0.0;
    }
    let target = 1.0 / active.len() as f64;
    let mse = active.iter().map(|s| (s - target).powi(2)).sum::<f64>() / active.len() as f64;
    mse.sqrt()
}

/// Check whether environment shares are within `tolerance` of their mean.
///
/// Returns the verdict and the normalized shares (each share divided by the
/// total), computed over environments carrying positive risk.
pub fn validate_environment_balance(
    weights: &[f64],
    cov: &CovarianceMatrix,
    labels: &[Option<Environment>],
    tolerance: f64,
) -> (bool, BTreeMap<Environment, f64>) {
    let shares = risk_by_environment(weights, cov, labels);
    let total: f64 = shares.values().filter(|&&s| s > 0.0).sum();
    if total <= 0.0 {
        return (false, shares);
    }

    let normalized: BTreeMap<Environment, f64> = shares
        .iter()
        .filter(|(_, &s)| s > 0.0)
        .map(|(e, &s)| (*e, s / total))
        .collect();
    let target = 1.0 / normalized.len() as f64;
    let balanced = normalized.values().all(|s| (s - target).abs() <= tolerance);
    (balanced, normalized)
}
