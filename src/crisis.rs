//! Rule-based crisis overlay.
//!
//! Three independent stress signals are evaluated on prices up to a given
//! row:
//!
//! 1. **Volatility spike**: the trailing short-window annualized volatility
//!    of any designated equity exceeds a multiple of its long-window average.
//! 2. **Drawdown**: any designated equity trades more than a threshold below
//!    its running peak.
//! 3. **Momentum break**: the benchmark closes below its trailing moving
//!    average.
//!
//! A crisis is declared when the active-signal count reaches the vote
//! threshold. Leaving requires the count to stay low for a sustained run of
//! days, so a single quiet day never ends a crisis. While in crisis the
//! engine replaces optimizer output with a static defensive allocation.

use crate::data::{simple_returns, PriceSeries};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Crisis detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrisisConfig {
    /// Equities checked by the volatility and drawdown signals.
    #[serde(default)]
    pub equity_assets: Vec<String>,
    /// Asset checked by the momentum signal.
    #[serde(default)]
    pub benchmark: Option<String>,
    /// Short window for rolling volatility (days).
    #[serde(default = "default_vol_window")]
    pub vol_window: usize,
    /// Number of rolling-volatility values averaged for the baseline.
    #[serde(default = "default_vol_average_window")]
    pub vol_average_window: usize,
    /// Spike multiple over the baseline.
    #[serde(default = "default_vol_spike_multiple")]
    pub vol_spike_multiple: f64,
    /// Drawdown from peak that triggers the signal (positive fraction).
    #[serde(default = "default_drawdown_threshold")]
    pub drawdown_threshold: f64,
    /// Moving-average window for the momentum signal.
    #[serde(default = "default_momentum_window")]
    pub momentum_window: usize,
    /// Active signals needed to enter a crisis.
    #[serde(default = "default_vote_threshold")]
    pub vote_threshold: usize,
    /// Days examined before leaving a crisis.
    #[serde(default = "default_exit_lookback")]
    pub exit_lookback: usize,
    /// Bond assets of the defensive allocation.
    #[serde(default)]
    pub bond_assets: Vec<String>,
    /// Hedge assets (gold, commodities) of the defensive allocation.
    #[serde(default)]
    pub hedge_assets: Vec<String>,
    #[serde(default = "default_bond_weight")]
    pub defensive_bond_weight: f64,
    #[serde(default = "default_hedge_weight")]
    pub defensive_hedge_weight: f64,
}

fn default_vol_window() -> usize { 60 }
fn default_vol_average_window() -> usize { 252 }
fn default_vol_spike_multiple() -> f64 { 2.0 }
fn default_drawdown_threshold() -> f64 { 0.15 }
fn default_momentum_window() -> usize { 200 }
fn default_vote_threshold() -> usize { 2 }
fn default_exit_lookback() -> usize { 5 }
fn default_bond_weight() -> f64 { 0.70 }
fn default_hedge_weight() -> f64 { 0.30 }

impl Default for CrisisConfig {
    fn default() -> Self {
        Self {
            equity_assets: Vec::new(),
            benchmark: None,
            vol_window: default_vol_window(),
            vol_average_window: default_vol_average_window(),
            vol_spike_multiple: default_vol_spike_multiple(),
            drawdown_threshold: default_drawdown_threshold(),
            momentum_window: default_momentum_window(),
            vote_threshold: default_vote_threshold(),
            exit_lookback: default_exit_lookback(),
            bond_assets: Vec::new(),
            hedge_assets: Vec::new(),
            defensive_bond_weight: default_bond_weight(),
            defensive_hedge_weight: default_hedge_weight(),
        }
    }
}

impl CrisisConfig {
    /// Two of three signals enter a crisis.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// All three signals are needed to enter a crisis.
    pub fn conservative() -> Self {
        Self {
            vote_threshold: 3,
            ..Self::default()
        }
    }

    pub fn with_equities<S: Into<String>>(mut self, assets: impl IntoIterator<Item = S>) -> Self {
        self.equity_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_benchmark(mut self, asset: impl Into<String>) -> Self {
        self.benchmark = Some(asset.into());
        self
    }

    pub fn with_defensive<S: Into<String>>(
        mut self,
        bonds: impl IntoIterator<Item = S>,
        hedges: impl IntoIterator<Item = S>,
    ) -> Self {
        self.bond_assets = bonds.into_iter().map(Into::into).collect();
        self.hedge_assets = hedges.into_iter().map(Into::into).collect();
        self
    }
}

/// Signal values on one day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrisisSignals {
    pub volatility_spike: bool,
    pub drawdown: bool,
    pub momentum_break: bool,
}

impl CrisisSignals {
    pub fn count(&self) -> usize {
        [self.volatility_spike, self.drawdown, self.momentum_break]
            .iter()
            .filter(|&&s| s)
            .count()
    }
}

/// Crisis status after a daily update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrisisState {
    pub is_crisis: bool,
    pub active_signals: usize,
    pub signals: CrisisSignals,
    /// True when this update entered or left a crisis.
    pub changed: bool,
}

/// Trailing sample-std volatility of daily returns, annualized, one value
/// per price from index `window` on.
pub fn rolling_volatility(prices: &[f64], window: usize) -> Vec<f64> {
    if window < 2 {
        return Vec::new();
    }
    let returns = simple_returns(prices);
    returns
        .windows(window)
        .map(|w| {
            let n = w.len() as f64;
            let mean = w.iter().sum::<f64>() / n;
            let var = w.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
            var.sqrt() * 252f64.sqrt()
        })
        .collect()
}

/// Ratio of current rolling volatility to the mean of the last
/// `average_window` rolling values. `None` without enough history.
pub fn volatility_ratio(prices: &[f64], vol_window: usize, average_window: usize) -> Option<f64> {
    let needed = vol_window + average_window;
    if average_window == 0 || prices.len() < needed {
        return None;
    }
    let tail = &prices[prices.len() - needed..];
    let vols = rolling_volatility(tail, vol_window);
    let recent = &vols[vols.len().saturating_sub(average_window)..];
    if recent.len() < average_window {
        return None;
    }
    let avg = recent.iter().sum::<f64>() / recent.len() as f64;
    let current = *recent.last()?;
    if !avg.is_finite() || avg < 1e-10 || !current.is_finite() {
        return None;
    }
    Some(current / avg)
}

/// Current drawdown from the running peak (zero or negative).
pub fn current_drawdown(prices: &[f64]) -> Option<f64> {
    if prices.len() < 2 {
        return None;
    }
    let peak = prices.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    drawdown_from_peak(*prices.last()?, peak)
}

/// Drawdown of `last` below a known running `peak`.
pub fn drawdown_from_peak(last: f64, peak: f64) -> Option<f64> {
    if peak <= 1e-10 || !last.is_finite() {
        return None;
    }
    Some((last - peak) / peak)
}

/// Whether the last price is below its trailing `window`-day mean.
pub fn below_moving_average(prices: &[f64], window: usize) -> Option<bool> {
    if window == 0 || prices.len() < window {
        return None;
    }
    let tail = &prices[prices.len() - window..];
    let ma = tail.iter().sum::<f64>() / window as f64;
    let last = *prices.last()?;
    if !ma.is_finite() || ma < 1e-10 {
        return None;
    }
    Some(last < ma)
}

/// Stateful crisis detector with exit hysteresis.
#[derive(Debug, Clone)]
pub struct CrisisDetector {
    config: CrisisConfig,
    equities: Vec<usize>,
    benchmark: Option<usize>,
    in_crisis: bool,
    history: Vec<usize>,
    /// Running peak per equity over rows `0..=tracked_through`.
    peaks: Vec<f64>,
    tracked_through: Option<usize>,
}

impl CrisisDetector {
    /// Resolve configured assets against a universe. Names missing from the
    /// universe are ignored.
    pub fn new(config: CrisisConfig, assets: &[String]) -> Self {
        let position = |name: &String| assets.iter().position(|a| a == name);

        let equities: Vec<usize> = config.equity_assets.iter().filter_map(position).collect();
        if equities.len() < config.equity_assets.len() {
            warn!("Some crisis equities are not in the universe and will be ignored");
        }
        let benchmark = config.benchmark.as_ref().and_then(position);
        if config.benchmark.is_some() && benchmark.is_none() {
            warn!("Crisis benchmark is not in the universe; momentum signal disabled");
        }

        Self {
            config,
            equities,
            benchmark,
            in_crisis: false,
            history: Vec::new(),
            peaks: Vec::new(),
            tracked_through: None,
        }
    }

    pub fn config(&self) -> &CrisisConfig {
        &self.config
    }

    pub fn is_crisis(&self) -> bool {
        self.in_crisis
    }

    /// Signal counts seen so far, in update order.
    pub fn history(&self) -> &[usize] {
        &self.history
    }

    /// Evaluate the three signals on rows `0..=day`.
    pub fn detect(&self, prices: &PriceSeries, day: usize) -> CrisisSignals {
        if prices.is_empty() {
            return CrisisSignals::default();
        }
        let day = day.min(prices.len() - 1);
        self.evaluate(prices, day, |slot| {
            prices
                .column_iter(self.equities[slot], day)
                .fold(f64::NEG_INFINITY, f64::max)
        })
    }

    /// Record today's signal count and advance the crisis state. Call once
    /// per simulated day with ascending days over the same series.
    pub fn update(&mut self, prices: &PriceSeries, day: usize) -> CrisisState {
        if prices.is_empty() {
            return self.advance(CrisisSignals::default());
        }
        let day = day.min(prices.len() - 1);
        self.track_peaks(prices, day);

        let peaks = &self.peaks;
        let signals = self.evaluate(prices, day, |slot| peaks[slot]);
        self.advance(signals)
    }

    /// Extend the running equity peaks through `day`. Starts over when
    /// `day` precedes the rows already seen.
    fn track_peaks(&mut self, prices: &PriceSeries, day: usize) {
        let from = match self.tracked_through {
            Some(last) if last <= day => last + 1,
            _ => {
                self.peaks = vec![f64::NEG_INFINITY; self.equities.len()];
                0
            }
        };
        for d in from..=day {
            let row = prices.row(d);
            for (peak, &asset) in self.peaks.iter_mut().zip(&self.equities) {
                *peak = peak.max(row[asset]);
            }
        }
        self.tracked_through = Some(day);
    }

    /// Signals on rows `0..=day`. `peak` maps an index into the equity list
    /// to that equity's running peak.
    fn evaluate(
        &self,
        prices: &PriceSeries,
        day: usize,
        peak: impl Fn(usize) -> f64,
    ) -> CrisisSignals {
        let cfg = &self.config;
        let mut signals = CrisisSignals::default();
        let vol_len = cfg.vol_window + cfg.vol_average_window;

        for (slot, &asset) in self.equities.iter().enumerate() {
            if !signals.volatility_spike {
                let tail = prices.column_tail(asset, day, vol_len);
                signals.volatility_spike =
                    volatility_ratio(&tail, cfg.vol_window, cfg.vol_average_window)
                        .is_some_and(|ratio| ratio > cfg.vol_spike_multiple);
            }
            // A drawdown needs at least two prices.
            if !signals.drawdown && day >= 1 {
                signals.drawdown = drawdown_from_peak(prices.row(day)[asset], peak(slot))
                    .is_some_and(|dd| dd < -cfg.drawdown_threshold);
            }
            if signals.volatility_spike && signals.drawdown {
                break;
            }
        }

        if let Some(bench) = self.benchmark {
            let tail = prices.column_tail(bench, day, cfg.momentum_window);
            signals.momentum_break =
                below_moving_average(&tail, cfg.momentum_window).unwrap_or(false);
        }

        signals
    }

    /// Advance the state machine with an externally computed signal set.
    pub fn advance(&mut self, signals: CrisisSignals) -> CrisisState {
        let count = signals.count();
        self.history.push(count);

        let was_crisis = self.in_crisis;
        if self.in_crisis {
            if self.should_exit() {
                self.in_crisis = false;
                info!("Leaving crisis mode ({} active signals)", count);
            }
        } else if count >= self.config.vote_threshold {
            self.in_crisis = true;
            info!("Entering crisis mode ({} active signals)", count);
        }

        CrisisState {
            is_crisis: self.in_crisis,
            active_signals: count,
            signals,
            changed: was_crisis != self.in_crisis,
        }
    }

    /// At least `exit_lookback − 1` of the last `exit_lookback` counts are at
    /// or below `vote_threshold − 2`.
    fn should_exit(&self) -> bool {
        let lookback = self.config.exit_lookback.max(1);
        if self.history.len() < lookback {
            return false;
        }
        let Some(exit_level) = self.config.vote_threshold.checked_sub(2) else {
            return false;
        };
        let quiet = self.history[self.history.len() - lookback..]
            .iter()
            .filter(|&&c| c <= exit_level)
            .count();
        quiet >= lookback.saturating_sub(1).max(1)
    }

    /// Defensive weights over `assets`: the bond share split evenly over
    /// available bonds, the hedge share over available hedges, normalized.
    /// Equal weight when neither group is available.
    pub fn defensive_weights(&self, assets: &[String]) -> Vec<f64> {
        defensive_weights(&self.config, assets)
    }
}

/// See [`CrisisDetector::defensive_weights`].
pub fn defensive_weights(config: &CrisisConfig, assets: &[String]) -> Vec<f64> {
    let n = assets.len();
    let bonds: Vec<usize> = (0..n).filter(|&i| config.bond_assets.contains(&assets[i])).collect();
    let hedges: Vec<usize> = (0..n)
        .filter(|&i| config.hedge_assets.contains(&assets[i]) && !bonds.contains(&i))
        .collect();

    if bonds.is_empty() && hedges.is_empty() {
        return vec![1.0 / n as f64; n];
    }

    let mut weights = vec![0.0; n];
    for &i in &bonds {
        weights[i] = config.defensive_bond_weight / bonds.len() as f64;
    }
    for &i in &hedges {
        weights[i] = config.defensive_hedge_weight / hedges.len() as f64;
    }

    let total: f64 = weights.iter().sum();
    if total > 0.0 {
        weights.iter_mut().for_each(|w| *w /= total);
        weights
    } else {
        vec![1.0 / n as f64; n]
    }
}
