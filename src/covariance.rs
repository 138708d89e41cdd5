//! Covariance estimation over a return window.
//!
//! Two estimators are available:
//!
//! - **Sample**: unbiased covariance of the demeaned returns (`n − 1`
//!   denominator).
//! - **Shrinkage**: a Ledoit-Wolf style blend of the biased sample covariance
//!   with a constant-correlation prior. Every pairwise correlation in the
//!   prior equals the average sample correlation, and its diagonal keeps the
//!   sample variances.
//!
//! An optional eigenvalue floor turns the result into a positive
//! semidefinite matrix for inputs where rounding breaks that property.

use crate::error::{BacktestError, Result};
use nalgebra::{DMatrix, SymmetricEigen};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Row-major symmetric covariance matrix.
pub type CovarianceMatrix = Vec<Vec<f64>>;

/// Standard deviations below this are treated as zero variance.
const ZERO_SD: f64 = 1e-12;

/// Estimator variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CovarianceMethod {
    #[default]
    Sample,
    ConstantCorrelationShrinkage,
}

/// Covariance estimator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CovarianceEstimator {
    pub method: CovarianceMethod,
    /// Floor eigenvalues at `psd_floor` when set.
    pub psd_floor: Option<f64>,
}

impl Default for CovarianceEstimator {
    fn default() -> Self {
        Self {
            method: CovarianceMethod::Sample,
            psd_floor: None,
        }
    }
}

/// An estimated covariance matrix with the shrinkage intensity used.
#[derive(Debug, Clone, PartialEq)]
pub struct CovarianceEstimate {
    pub matrix: CovarianceMatrix,
    /// Weight on the prior, in `[0, 1]`. Zero for the sample estimator.
    pub shrinkage: f64,
}

impl CovarianceEstimator {
    pub fn sample() -> Self {
        Self::default()
    }

    pub fn shrinkage() -> Self {
        Self {
            method: CovarianceMethod::ConstantCorrelationShrinkage,
            psd_floor: None,
        }
    }

    pub fn with_psd_floor(mut self, eps: f64) -> Self {
        self.psd_floor = Some(eps);
        self
    }

    /// Estimate covariance from return rows (`returns[t][asset]`).
    pub fn estimate(&self, returns: &[Vec<f64>]) -> Result<CovarianceEstimate> {
        validate_returns(returns)?;

        let (matrix, shrinkage) = match self.method {
            CovarianceMethod::Sample => (sample_covariance(returns)?, 0.0),
            CovarianceMethod::ConstantCorrelationShrinkage => shrink_to_constant_correlation(returns),
        };

        let matrix = match self.psd_floor {
            Some(eps) => psd_floor(&matrix, eps),
            None => matrix,
        };

        Ok(CovarianceEstimate { matrix, shrinkage })
    }
}

fn validate_returns(returns: &[Vec<f64>]) -> Result<()> {
    let first = returns
        .first()
        .ok_or_else(|| BacktestError::DataError("Empty return window".to_string()))?;
    let p = first.len();
    if p == 0 {
        return Err(BacktestError::DataError("Return window has no assets".to_string()));
    }
    for (t, row) in returns.iter().enumerate() {
        if row.len() != p {
            return Err(BacktestError::DataError(format!(
                "Return row {} has {} values, expected {}",
                t,
                row.len(),
                p
            )));
        }
        if row.iter().any(|r| !r.is_finite()) {
            return Err(BacktestError::DataError(format!(
                "Non-finite return in row {}",
                t
            )));
        }
    }
    Ok(())
}

fn column_means(returns: &[Vec<f64>]) -> Vec<f64> {
    let n = returns.len() as f64;
    let p = returns[0].len();
    let mut means = vec![0.0; p];
    for row in returns {
        for (m, r) in means.iter_mut().zip(row) {
            *m += r;
        }
    }
    means.iter_mut().for_each(|m| *m /= n);
    means
}

fn demeaned(returns: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let means = column_means(returns);
    returns
        .iter()
        .map(|row| row.iter().zip(&means).map(|(r, m)| r - m).collect())
        .collect()
}

/// `XᵀX / denom` over demeaned rows.
fn cross_product(x: &[Vec<f64>], denom: f64) -> CovarianceMatrix {
    let p = x[0].len();
    let mut s = vec![vec![0.0; p]; p];
    for row in x {
        for i in 0..p {
            for j in i..p {
                s[i][j] += row[i] * row[j];
            }
        }
    }
    for i in 0..p {
        for j in i..p {
            s[i][j] /= denom;
            s[j][i] = s[i][j];
        }
    }
    s
}

/// Unbiased sample covariance. Requires at least two observations.
pub fn sample_covariance(returns: &[Vec<f64>]) -> Result<CovarianceMatrix> {
    validate_returns(returns)?;
    if returns.len() < 2 {
        return Err(BacktestError::DataError(
            "Sample covariance needs at least two observations".to_string(),
        ));
    }
    let x = demeaned(returns);
    Ok(cross_product(&x, (returns.len() - 1) as f64))
}

/// Shrink the biased sample covariance towards a constant-correlation prior.
///
/// Returns the blended matrix and the intensity placed on the prior.
pub fn shrink_to_constant_correlation(returns: &[Vec<f64>]) -> (CovarianceMatrix, f64) {
    let n = returns.len() as f64;
    let x = demeaned(returns);
    let p = x[0].len();
    let sample = cross_product(&x, n);

    let sd: Vec<f64> = (0..p).map(|i| sample[i][i].max(0.0).sqrt()).collect();

    let r_bar = if p > 1 {
        let mut corr_sum = 0.0;
        for i in 0..p {
            for j in 0..p {
                if i != j && sd[i] > ZERO_SD && sd[j] > ZERO_SD {
                    corr_sum += sample[i][j] / (sd[i] * sd[j]);
                }
            }
        }
        corr_sum / (p * (p - 1)) as f64
    } else {
        0.0
    };

    let mut prior = vec![vec![0.0; p]; p];
    for i in 0..p {
        for j in 0..p {
            prior[i][j] = if i == j {
                sample[i][i]
            } else {
                r_bar * sd[i] * sd[j]
            };
        }
    }

    let gamma: f64 = (0..p)
        .flat_map(|i| (0..p).map(move |j| (i, j)))
        .map(|(i, j)| (sample[i][j] - prior[i][j]).powi(2))
        .sum();

    // pi: sum over assets of the population variance of squared deviations.
    let pi: f64 = (0..p)
        .map(|i| {
            let sq: Vec<f64> = x.iter().map(|row| row[i] * row[i]).collect();
            let mean = sq.iter().sum::<f64>() / n;
            sq.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n
        })
        .sum();

    let kappa = (pi - gamma) / n;
    let shrinkage = if gamma > f64::EPSILON {
        (kappa / gamma).clamp(0.0, 1.0)
    } else {
        0.0
    };

    debug!(
        "Covariance shrinkage: r_bar={:.4}, intensity={:.4}",
        r_bar, shrinkage
    );

    let blended = (0..p)
        .map(|i| {
            (0..p)
                .map(|j| shrinkage * prior[i][j] + (1.0 - shrinkage) * sample[i][j])
                .collect()
        })
        .collect();

    (blended, shrinkage)
}

/// Floor the eigenvalues of a symmetric matrix at `eps`.
///
/// The matrix is returned unchanged (apart from symmetrization) when no
/// eigenvalue needed flooring.
pub fn psd_floor(matrix: &CovarianceMatrix, eps: f64) -> CovarianceMatrix {
    let p = matrix.len();
    if p == 0 {
        return matrix.clone();
    }

    let m = DMatrix::from_fn(p, p, |i, j| 0.5 * (matrix[i][j] + matrix[j][i]));
    let eig = SymmetricEigen::new(m.clone());

    if eig.eigenvalues.iter().all(|&l| l >= eps) {
        return (0..p).map(|i| (0..p).map(|j| m[(i, j)]).collect()).collect();
    }

    debug!(
        "Flooring covariance eigenvalues: min={:.3e}",
        eig.eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min)
    );

    let mut values = eig.eigenvalues.clone();
    for v in values.iter_mut() {
        if *v < eps {
            *v = eps;
        }
    }
    let rebuilt = &eig.eigenvectors * DMatrix::from_diagonal(&values) * eig.eigenvectors.transpose();

    (0..p)
        .map(|i| {
            (0..p)
                .map(|j| 0.5 * (rebuilt[(i, j)] + rebuilt[(j, i)]))
                .collect()
        })
        .collect()
}

/// Per-asset volatility (square root of the diagonal).
pub fn volatilities(cov: &CovarianceMatrix) -> Vec<f64> {
    (0..cov.len()).map(|i| cov[i][i].max(0.0).sqrt()).collect()
}
