//! Equal-risk-contribution optimizer.
//!
//! The optimizer minimizes the dispersion of per-asset risk contributions
//! `RC_i = w_i (Σw)_i / σ_p` over long-only, fully invested weights, subject
//! to optional linear allocation bounds. With a Sharpe weight λ or an
//! environment weight β it minimizes the composite
//!
//! ```text
//! (1 − λ) · std(RC) + λ · (−Sharpe) + β · environment imbalance
//! ```
//!
//! instead. The solver is sequential quadratic programming: each iteration
//! solves a convex QP in the step `d` with Clarabel, using a damped BFGS
//! approximation of the Hessian and central-difference gradients, followed
//! by a backtracking line search. Iterates stay feasible once the start
//! point has been projected onto the constraint set.
//!
//! Solver trouble never escapes as an error. It produces
//! [`OptimizationOutcome::Fallback`] carrying inverse-volatility weights and
//! the [`FallbackReason`].

use crate::covariance::{volatilities, CovarianceEstimator, CovarianceMatrix};
use crate::environment::{imbalance_penalty, risk_by_environment, Environment, EnvironmentMap};
use crate::error::{BacktestError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Objective value returned when the portfolio has (numerically) no risk.
pub const DEGENERATE_PENALTY: f64 = 1e10;

/// Portfolio volatility below this is treated as zero.
const MIN_VOL: f64 = 1e-10;

/// Maximum constraint violation accepted on a solution.
const FEASIBILITY_TOL: f64 = 1e-3;

const FD_STEP: f64 = 1e-7;
const ARMIJO_C: f64 = 1e-4;
const MAX_BACKTRACKS: usize = 40;

// ============================================================================
// Configuration
// ============================================================================

/// Aggregate weight bound on a named asset subset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBound {
    pub assets: Vec<String>,
    pub limit: f64,
}

impl GroupBound {
    pub fn new<S: Into<String>>(assets: impl IntoIterator<Item = S>, limit: f64) -> Self {
        Self {
            assets: assets.into_iter().map(Into::into).collect(),
            limit,
        }
    }
}

/// Linear allocation constraints on top of `Σw = 1, 0 ≤ w ≤ 1`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationConstraints {
    /// `Σ_{i∈A} w_i ≥ limit`.
    pub min_group: Option<GroupBound>,
    /// `Σ_{i∈B} w_i ≤ limit`.
    pub max_group: Option<GroupBound>,
    /// Per-asset cap.
    pub max_single_asset: Option<f64>,
}

impl AllocationConstraints {
    pub fn none() -> Self {
        Self::default()
    }

    /// Stocks at least 60%, bonds at most 35%.
    pub fn equity_tilted<S: Into<String>>(
        stocks: impl IntoIterator<Item = S>,
        bonds: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            min_group: Some(GroupBound::new(stocks, 0.60)),
            max_group: Some(GroupBound::new(bonds, 0.35)),
            max_single_asset: None,
        }
    }

    pub fn with_min_group(mut self, bound: GroupBound) -> Self {
        self.min_group = Some(bound);
        self
    }

    pub fn with_max_group(mut self, bound: GroupBound) -> Self {
        self.max_group = Some(bound);
        self
    }

    pub fn with_max_single_asset(mut self, cap: f64) -> Self {
        self.max_single_asset = Some(cap);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.min_group.is_none() && self.max_group.is_none() && self.max_single_asset.is_none()
    }

    /// Check that every named asset belongs to the universe and limits are sane.
    pub fn validate(&self, assets: &[String]) -> Result<()> {
        for (kind, bound) in [("min", &self.min_group), ("max", &self.max_group)] {
            if let Some(bound) = bound {
                if !(0.0..=1.0).contains(&bound.limit) {
                    return Err(BacktestError::ConfigError(format!(
                        "Group {} limit must be in [0, 1], got {}",
                        kind, bound.limit
                    )));
                }
                if bound.assets.is_empty() {
                    return Err(BacktestError::ConfigError(format!(
                        "Group {} bound names no assets",
                        kind
                    )));
                }
                if let Some(missing) = bound.assets.iter().find(|a| !assets.contains(a)) {
                    return Err(BacktestError::ConfigError(format!(
                        "Constraint asset {} not in universe",
                        missing
                    )));
                }
            }
        }
        if let Some(cap) = self.max_single_asset {
            if !(cap > 0.0 && cap <= 1.0) {
                return Err(BacktestError::ConfigError(format!(
                    "max_single_asset must be in (0, 1], got {}",
                    cap
                )));
            }
        }
        Ok(())
    }
}

/// Optimizer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// SQP iteration cap.
    pub max_iter: usize,
    /// Objective change tolerance.
    pub ftol: f64,
    /// λ: weight on the negative Sharpe ratio.
    pub sharpe_weight: f64,
    /// β: weight on the environment imbalance penalty.
    pub environment_weight: f64,
    /// EWMA span for expected returns.
    pub ewma_span: usize,
    /// Annual risk-free rate used in the Sharpe term.
    pub risk_free_rate: f64,
    pub covariance: CovarianceEstimator,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iter: 1000,
            ftol: 1e-9,
            sharpe_weight: 0.0,
            environment_weight: 0.0,
            ewma_span: 252,
            risk_free_rate: 0.0,
            covariance: CovarianceEstimator::default(),
        }
    }
}

impl OptimizerConfig {
    fn is_composite(&self) -> bool {
        self.sharpe_weight > 0.0 || self.environment_weight > 0.0
    }
}

// ============================================================================
// Outcome
// ============================================================================

/// Why the optimizer fell back to inverse-volatility weights.
#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    /// The constraint set is empty.
    Infeasible,
    /// The QP subproblem could not be solved.
    SolverFailed(String),
    /// Iteration cap reached before convergence.
    MaxIterations(usize),
    /// The objective evaluated to NaN or infinity.
    NonFiniteObjective,
    /// The final point violates the constraints beyond tolerance.
    ConstraintViolation(f64),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Infeasible => write!(f, "constraints are infeasible"),
            FallbackReason::SolverFailed(status) => write!(f, "QP solver failed: {}", status),
            FallbackReason::MaxIterations(n) => write!(f, "no convergence in {} iterations", n),
            FallbackReason::NonFiniteObjective => write!(f, "objective is not finite"),
            FallbackReason::ConstraintViolation(v) => {
                write!(f, "solution violates constraints by {:.2e}", v)
            }
        }
    }
}

/// Result of one optimization.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizationOutcome {
    Converged {
        weights: Vec<f64>,
        iterations: usize,
        objective: f64,
    },
    Fallback {
        weights: Vec<f64>,
        reason: FallbackReason,
    },
}

impl OptimizationOutcome {
    pub fn weights(&self) -> &[f64] {
        match self {
            OptimizationOutcome::Converged { weights, .. } => weights,
            OptimizationOutcome::Fallback { weights, .. } => weights,
        }
    }

    pub fn into_weights(self) -> Vec<f64> {
        match self {
            OptimizationOutcome::Converged { weights, .. } => weights,
            OptimizationOutcome::Fallback { weights, .. } => weights,
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, OptimizationOutcome::Converged { .. })
    }

    pub fn fallback_reason(&self) -> Option<&FallbackReason> {
        match self {
            OptimizationOutcome::Fallback { reason, .. } => Some(reason),
            OptimizationOutcome::Converged { .. } => None,
        }
    }
}

// ============================================================================
// Portfolio math helpers
// ============================================================================

fn mat_vec(cov: &[Vec<f64>], w: &[f64]) -> Vec<f64> {
    cov.iter()
        .map(|row| row.iter().zip(w).map(|(c, x)| c * x).sum())
        .collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn inf_norm(v: &[f64]) -> f64 {
    v.iter().fold(0.0f64, |m, x| m.max(x.abs()))
}

fn population_std(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

/// Portfolio volatility `sqrt(wᵀΣw)`.
pub fn portfolio_volatility(weights: &[f64], cov: &CovarianceMatrix) -> f64 {
    dot(weights, &mat_vec(cov, weights)).max(0.0).sqrt()
}

/// Per-asset risk contributions. All zero for a riskless portfolio.
pub fn risk_contribution(weights: &[f64], cov: &CovarianceMatrix) -> Vec<f64> {
    let marginal = mat_vec(cov, weights);
    let vol = dot(weights, &marginal).max(0.0).sqrt();
    if vol < MIN_VOL {
        return vec![0.0; weights.len()];
    }
    weights
        .iter()
        .zip(&marginal)
        .map(|(w, m)| w * m / vol)
        .collect()
}

/// Population standard deviation of risk contributions, or
/// [`DEGENERATE_PENALTY`] for a riskless portfolio.
pub fn risk_parity_objective(weights: &[f64], cov: &CovarianceMatrix) -> f64 {
    if portfolio_volatility(weights, cov) < MIN_VOL {
        return DEGENERATE_PENALTY;
    }
    population_std(&risk_contribution(weights, cov))
}

/// Weights proportional to inverse volatility. Volatilities are floored at
/// `1e-10`.
pub fn inverse_volatility_weights(cov: &CovarianceMatrix) -> Vec<f64> {
    let inv: Vec<f64> = volatilities(cov)
        .into_iter()
        .map(|v| 1.0 / v.max(MIN_VOL))
        .collect();
    let total: f64 = inv.iter().sum();
    inv.into_iter().map(|x| x / total).collect()
}

/// Exponentially weighted mean of each column, recursive form seeded with
/// the first observation.
pub fn ewma_mean(returns: &[Vec<f64>], span: usize) -> Vec<f64> {
    let Some(first) = returns.first() else {
        return Vec::new();
    };
    let alpha = 2.0 / (span.max(1) as f64 + 1.0);
    let mut mean = first.clone();
    for row in &returns[1..] {
        for (m, r) in mean.iter_mut().zip(row) {
            *m = alpha * r + (1.0 - alpha) * *m;
        }
    }
    mean
}

/// Check sum-to-one and `[0, 1]` bounds within `tolerance`.
pub fn validate_weights(weights: &[f64], tolerance: f64) -> Result<()> {
    let sum: f64 = weights.iter().sum();
    if (sum - 1.0).abs() > tolerance {
        return Err(BacktestError::InvalidInput(format!(
            "Weights sum to {:.4}, expected 1.0",
            sum
        )));
    }
    if let Some(w) = weights.iter().find(|&&w| w < -tolerance) {
        return Err(BacktestError::InvalidInput(format!("Negative weight found: {}", w)));
    }
    if let Some(w) = weights.iter().find(|&&w| w > 1.0 + tolerance) {
        return Err(BacktestError::InvalidInput(format!("Weight above 1 found: {}", w)));
    }
    Ok(())
}

/// Whether risk contributions are equal within `tolerance` (std-dev), and
/// the std-dev itself.
pub fn check_risk_parity(weights: &[f64], cov: &CovarianceMatrix, tolerance: f64) -> (bool, f64) {
    let dispersion = population_std(&risk_contribution(weights, cov));
    (dispersion < tolerance, dispersion)
}

/// Scale weights uniformly towards a target annualized volatility computed
/// from the covariance. Weights summing above 1 after scaling are
/// renormalized.
pub fn apply_volatility_target(
    weights: &[f64],
    cov: &CovarianceMatrix,
    target_vol: f64,
    annualization: f64,
) -> Vec<f64> {
    let vol = portfolio_volatility(weights, cov) * annualization;
    if vol < MIN_VOL {
        return weights.to_vec();
    }
    let scale = target_vol / vol;
    let scaled: Vec<f64> = weights.iter().map(|w| w * scale).collect();
    let total: f64 = scaled.iter().sum();
    if total > 1.0 {
        scaled.into_iter().map(|w| w / total).collect()
    } else {
        scaled
    }
}

// ============================================================================
// Objective
// ============================================================================

struct Objective<'a> {
    cov: &'a CovarianceMatrix,
    expected_returns: Option<&'a [f64]>,
    labels: &'a [Option<Environment>],
    sharpe_weight: f64,
    environment_weight: f64,
    daily_rf: f64,
    composite: bool,
}

impl Objective<'_> {
    /// The reported objective.
    fn value(&self, w: &[f64]) -> f64 {
        let vol = portfolio_volatility(w, self.cov);
        if vol < MIN_VOL {
            return DEGENERATE_PENALTY;
        }
        let dispersion = population_std(&risk_contribution(w, self.cov));
        if !self.composite {
            return dispersion;
        }

        let sharpe = match self.expected_returns {
            Some(mu) => (dot(w, mu) - self.daily_rf) / vol,
            None => 0.0,
        };
        let penalty = if self.environment_weight > 0.0 {
            imbalance_penalty(&risk_by_environment(w, self.cov, self.labels))
        } else {
            0.0
        };

        (1.0 - self.sharpe_weight) * dispersion - self.sharpe_weight * sharpe
            + self.environment_weight * penalty
    }

    /// The function driven by the solver. For pure risk parity this is the
    /// variance of contributions, which has the same minimizer as the
    /// std-dev and is smooth at the optimum.
    fn solver_value(&self, w: &[f64]) -> f64 {
        if self.composite {
            return self.value(w);
        }
        let vol = portfolio_volatility(w, self.cov);
        if vol < MIN_VOL {
            return DEGENERATE_PENALTY;
        }
        population_std(&risk_contribution(w, self.cov)).powi(2)
    }
}

// ============================================================================
// Linear constraints and the QP subproblem
// ============================================================================

/// `Σw = 1` plus rows `a·w ≤ rhs`.
struct LinearConstraints {
    n: usize,
    rows: Vec<(Vec<f64>, f64)>,
}

impl LinearConstraints {
    fn build(assets: &[String], constraints: &AllocationConstraints) -> Self {
        let n = assets.len();
        let upper = constraints.max_single_asset.unwrap_or(1.0).min(1.0);
        let mut rows = Vec::with_capacity(2 * n + 2);

        for i in 0..n {
            let mut lower = vec![0.0; n];
            lower[i] = -1.0;
            rows.push((lower, 0.0));

            let mut cap = vec![0.0; n];
            cap[i] = 1.0;
            rows.push((cap, upper));
        }

        let indicator = |names: &[String], sign: f64| -> Vec<f64> {
            assets
                .iter()
                .map(|a| if names.contains(a) { sign } else { 0.0 })
                .collect()
        };

        if let Some(bound) = &constraints.min_group {
            rows.push((indicator(&bound.assets, -1.0), -bound.limit));
        }
        if let Some(bound) = &constraints.max_group {
            rows.push((indicator(&bound.assets, 1.0), bound.limit));
        }

        Self { n, rows }
    }

    fn max_violation(&self, w: &[f64]) -> f64 {
        let eq = (w.iter().sum::<f64>() - 1.0).abs();
        self.rows
            .iter()
            .map(|(a, rhs)| (dot(a, w) - rhs).max(0.0))
            .fold(eq, f64::max)
    }

    /// Solve `min ½dᵀBd + gᵀd` subject to the constraints holding at `w + d`.
    fn solve_step(&self, b: &[Vec<f64>], g: &[f64], w: &[f64]) -> std::result::Result<Vec<f64>, FallbackReason> {
        use clarabel::algebra::*;
        use clarabel::solver::*;

        let n = self.n;

        // P: upper triangle of B in CSC format.
        let mut p_data = Vec::new();
        let mut p_indices = Vec::new();
        let mut p_indptr = vec![0];
        for j in 0..n {
            for (i, row) in b.iter().enumerate().take(j + 1) {
                if row[j] != 0.0 {
                    p_data.push(row[j]);
                    p_indices.push(i);
                }
            }
            p_indptr.push(p_data.len());
        }
        let p = CscMatrix::new(n, n, p_indptr, p_indices, p_data);

        // A: row 0 is the budget equality, then the inequality rows.
        let m = 1 + self.rows.len();
        let mut a_data = Vec::new();
        let mut a_indices = Vec::new();
        let mut a_indptr = vec![0];
        for j in 0..n {
            a_data.push(1.0);
            a_indices.push(0);
            for (k, (coeffs, _)) in self.rows.iter().enumerate() {
                if coeffs[j] != 0.0 {
                    a_data.push(coeffs[j]);
                    a_indices.push(1 + k);
                }
            }
            a_indptr.push(a_data.len());
        }
        let a = CscMatrix::new(m, n, a_indptr, a_indices, a_data);

        let mut rhs = Vec::with_capacity(m);
        rhs.push(1.0 - w.iter().sum::<f64>());
        rhs.extend(self.rows.iter().map(|(coeffs, limit)| limit - dot(coeffs, w)));

        let cones = [ZeroConeT(1), NonnegativeConeT(self.rows.len())];

        let settings = DefaultSettingsBuilder::default()
            .max_iter(200)
            .verbose(false)
            .build()
            .map_err(|e| FallbackReason::SolverFailed(format!("settings: {}", e)))?;

        let mut solver = DefaultSolver::new(&p, g, &a, &rhs, &cones, settings)
            .map_err(|e| FallbackReason::SolverFailed(format!("{:?}", e)))?;

        solver.solve();

        match solver.solution.status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => Ok(solver.solution.x.clone()),
            SolverStatus::PrimalInfeasible | SolverStatus::AlmostPrimalInfeasible => {
                Err(FallbackReason::Infeasible)
            }
            status => Err(FallbackReason::SolverFailed(format!("{:?}", status))),
        }
    }
}

fn identity(n: usize, scale: f64) -> Vec<Vec<f64>> {
    (0..n)
        .map(|i| (0..n).map(|j| if i == j { scale } else { 0.0 }).collect())
        .collect()
}

fn gradient(f: &impl Fn(&[f64]) -> f64, w: &[f64]) -> Vec<f64> {
    let mut bumped = w.to_vec();
    (0..w.len())
        .map(|i| {
            bumped[i] = w[i] + FD_STEP;
            let up = f(&bumped);
            bumped[i] = w[i] - FD_STEP;
            let down = f(&bumped);
            bumped[i] = w[i];
            (up - down) / (2.0 * FD_STEP)
        })
        .collect()
}

/// Powell-damped BFGS update; keeps `b` positive definite.
fn damped_bfgs_update(b: &mut [Vec<f64>], s: &[f64], y: &[f64]) {
    let n = s.len();
    let bs = mat_vec(b, s);
    let sbs = dot(s, &bs);
    if sbs <= f64::EPSILON {
        return;
    }
    let sy = dot(s, y);
    let theta = if sy >= 0.2 * sbs {
        1.0
    } else {
        0.8 * sbs / (sbs - sy)
    };
    let r: Vec<f64> = (0..n).map(|i| theta * y[i] + (1.0 - theta) * bs[i]).collect();
    let sr = dot(s, &r);
    if sr <= f64::EPSILON {
        return;
    }
    for i in 0..n {
        for j in 0..n {
            b[i][j] += r[i] * r[j] / sr - bs[i] * bs[j] / sbs;
        }
    }
}

struct SqpSolution {
    weights: Vec<f64>,
    iterations: usize,
}

fn run_sqp(
    objective: &Objective<'_>,
    constraints: &LinearConstraints,
    max_iter: usize,
    ftol: f64,
) -> std::result::Result<SqpSolution, FallbackReason> {
    let n = constraints.n;
    let mut w = vec![1.0 / n as f64; n];

    if constraints.max_violation(&w) > 1e-12 {
        let d = constraints.solve_step(&identity(n, 1.0), &vec![0.0; n], &w)?;
        w.iter_mut().zip(&d).for_each(|(x, dx)| *x += dx);
        if constraints.max_violation(&w) > FEASIBILITY_TOL {
            return Err(FallbackReason::Infeasible);
        }
    }

    let raw = |x: &[f64]| objective.solver_value(x);
    let f0 = raw(&w);
    if !f0.is_finite() {
        return Err(FallbackReason::NonFiniteObjective);
    }
    let scale = f0.abs().max(1e-12);
    let f = |x: &[f64]| raw(x) / scale;

    let mut fx = f(&w);
    let mut g = gradient(&f, &w);
    let mut b = identity(n, 1.0);
    let mut hessian_scaled = false;

    for iter in 1..=max_iter {
        let d = constraints.solve_step(&b, &g, &w)?;
        if inf_norm(&d) < 1e-10 {
            return Ok(SqpSolution { weights: w, iterations: iter });
        }

        let slope = dot(&g, &d).min(0.0);
        let mut alpha = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_BACKTRACKS {
            let trial: Vec<f64> = w.iter().zip(&d).map(|(x, dx)| x + alpha * dx).collect();
            let ft = f(&trial);
            if ft.is_finite() && ft <= fx + ARMIJO_C * alpha * slope {
                accepted = Some((trial, ft));
                break;
            }
            alpha *= 0.5;
        }

        // No descent along the QP direction: stationary up to gradient noise.
        let Some((w_next, f_next)) = accepted else {
            return Ok(SqpSolution { weights: w, iterations: iter });
        };

        let s: Vec<f64> = w_next.iter().zip(&w).map(|(a, b)| a - b).collect();
        let g_next = gradient(&f, &w_next);
        let y: Vec<f64> = g_next.iter().zip(&g).map(|(a, b)| a - b).collect();

        if !hessian_scaled {
            let sy = dot(&s, &y);
            let yy = dot(&y, &y);
            if sy > f64::EPSILON && yy > 0.0 {
                b = identity(n, yy / sy);
            }
            hessian_scaled = true;
        }
        damped_bfgs_update(&mut b, &s, &y);

        let change = (fx - f_next).abs();
        w = w_next;
        fx = f_next;
        g = g_next;

        if change < ftol && inf_norm(&s) < 1e-4 {
            return Ok(SqpSolution { weights: w, iterations: iter });
        }
    }

    Err(FallbackReason::MaxIterations(max_iter))
}

// ============================================================================
// Optimizer
// ============================================================================

/// Risk-parity optimizer with optional bounds and composite objective.
#[derive(Debug, Clone, Default)]
pub struct RiskParityOptimizer {
    config: OptimizerConfig,
    constraints: AllocationConstraints,
    environments: EnvironmentMap,
}

impl RiskParityOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            constraints: AllocationConstraints::default(),
            environments: EnvironmentMap::default(),
        }
    }

    pub fn with_constraints(mut self, constraints: AllocationConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    pub fn with_environments(mut self, environments: EnvironmentMap) -> Self {
        self.environments = environments;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn constraints(&self) -> &AllocationConstraints {
        &self.constraints
    }

    /// Optimize from a return window (`returns[t][asset]`).
    ///
    /// Fails only on an unusable window or a constraint naming an unknown
    /// asset. Solver problems are reported through the outcome.
    pub fn optimize(&self, assets: &[String], returns: &[Vec<f64>]) -> Result<OptimizationOutcome> {
        let estimate = self.config.covariance.estimate(returns)?;
        let expected = if self.config.sharpe_weight > 0.0 {
            Some(ewma_mean(returns, self.config.ewma_span))
        } else {
            None
        };
        self.optimize_with_covariance(assets, &estimate.matrix, expected.as_deref())
    }

    /// Optimize against a given covariance and optional daily expected returns.
    pub fn optimize_with_covariance(
        &self,
        assets: &[String],
        cov: &CovarianceMatrix,
        expected_returns: Option<&[f64]>,
    ) -> Result<OptimizationOutcome> {
        let n = assets.len();
        if n == 0 || cov.len() != n || cov.iter().any(|row| row.len() != n) {
            return Err(BacktestError::DataError(format!(
                "Covariance shape does not match {} assets",
                n
            )));
        }
        if cov.iter().flatten().any(|v| !v.is_finite()) {
            return Err(BacktestError::DataError(
                "Covariance contains non-finite values".to_string(),
            ));
        }
        if let Some(mu) = expected_returns {
            if mu.len() != n {
                return Err(BacktestError::DataError(format!(
                    "{} expected returns for {} assets",
                    mu.len(),
                    n
                )));
            }
        }
        self.constraints.validate(assets)?;

        let labels = self.environments.resolve(assets);
        let objective = Objective {
            cov,
            expected_returns,
            labels: &labels,
            sharpe_weight: self.config.sharpe_weight,
            environment_weight: self.config.environment_weight,
            daily_rf: self.config.risk_free_rate / 252.0,
            composite: self.config.is_composite(),
        };
        let constraints = LinearConstraints::build(assets, &self.constraints);

        let solved = run_sqp(&objective, &constraints, self.config.max_iter, self.config.ftol)
            .and_then(|solution| {
                let mut weights: Vec<f64> = solution.weights.iter().map(|w| w.max(0.0)).collect();
                let total: f64 = weights.iter().sum();
                if total > 0.0 {
                    weights.iter_mut().for_each(|w| *w /= total);
                }
                let violation = constraints.max_violation(&weights);
                if violation > FEASIBILITY_TOL {
                    return Err(FallbackReason::ConstraintViolation(violation));
                }
                let value = objective.value(&weights);
                if !value.is_finite() {
                    return Err(FallbackReason::NonFiniteObjective);
                }
                Ok((weights, solution.iterations, value))
            });

        Ok(match solved {
            Ok((weights, iterations, objective)) => {
                debug!(
                    "Risk parity converged in {} iterations (objective {:.3e})",
                    iterations, objective
                );
                OptimizationOutcome::Converged {
                    weights,
                    iterations,
                    objective,
                }
            }
            Err(reason) => {
                warn!("Optimizer fell back to inverse volatility: {}", reason);
                OptimizationOutcome::Fallback {
                    weights: inverse_volatility_weights(cov),
                    reason,
                }
            }
        })
    }
}
