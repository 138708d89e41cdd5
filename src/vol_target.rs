//! Realized-volatility targeting.

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Rescales target weights so trailing realized volatility approaches a
/// target level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityTargeter {
    /// Annualized volatility target.
    pub target_vol: f64,
    /// Trailing window of portfolio returns (days).
    pub window: usize,
    /// Upper bound on the scale factor.
    pub max_leverage: f64,
    /// Returns required before any scaling happens.
    pub min_history: usize,
}

impl Default for VolatilityTargeter {
    fn default() -> Self {
        Self {
            target_vol: 0.10,
            window: 60,
            max_leverage: 1.0,
            min_history: 10,
        }
    }
}

impl VolatilityTargeter {
    pub fn new(target_vol: f64) -> Self {
        Self {
            target_vol,
            ..Self::default()
        }
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    pub fn with_max_leverage(mut self, max_leverage: f64) -> Self {
        self.max_leverage = max_leverage;
        self
    }

    /// Annualized sample volatility of the last `window` returns (all of them
    /// when fewer).
    pub fn realized_volatility(&self, returns: &[f64]) -> Option<f64> {
        if returns.len() < self.min_history.max(2) {
            return None;
        }
        let tail = &returns[returns.len().saturating_sub(self.window.max(2))..];
        let n = tail.len() as f64;
        let mean = tail.iter().sum::<f64>() / n;
        let var = tail.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let vol = var.sqrt() * 252f64.sqrt();
        vol.is_finite().then_some(vol)
    }

    /// Scale `weights` by `min(target / realized, max_leverage)`.
    ///
    /// Weights summing above one after scaling are renormalized to one. A
    /// scale below one leaves the remainder in cash. Too little history or a
    /// near-zero realized volatility returns the input unchanged.
    pub fn scale(&self, weights: &[f64], trailing_returns: &[f64]) -> Vec<f64> {
        let Some(realized) = self.realized_volatility(trailing_returns) else {
            return weights.to_vec();
        };
        if realized < 1e-10 {
            return weights.to_vec();
        }

        let factor = (self.target_vol / realized).min(self.max_leverage);
        let scaled: Vec<f64> = weights.iter().map(|w| w * factor).collect();
        let total: f64 = scaled.iter().sum();

        debug!(
            "Volatility target: realized={:.4}, target={:.4}, scale={:.4}",
            realized, self.target_vol, factor
        );

        if total > 1.0 {
            scaled.into_iter().map(|w| w / total).collect()
        } else {
            scaled
        }
    }
}
