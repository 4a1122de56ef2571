//! Backtest configuration
//!
//! A single immutable value handed to every component. Nothing in the engine
//! reads global settings, so several configurations can be evaluated side by
//! side (see [`crate::backtest::Backtest::run_many`]).

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BacktestError, Result};

/// Default forward horizon for stability labels (ticks)
pub const DEFAULT_LOOKAHEAD_TICKS: usize = 36;

/// Default penalty per stability bucket, most to least severe
pub const DEFAULT_STABILITY_PENALTIES: [f64; 5] = [40.0, 25.0, 15.0, 8.0, 3.0];

/// How the instability cut-off on stability scores is chosen
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstabilityThreshold {
    /// Fixed score; labels below it are unstable
    Fixed(f64),
    /// Percentile (0-100) of train-split scores
    Percentile(f64),
}

impl Default for InstabilityThreshold {
    fn default() -> Self {
        InstabilityThreshold::Fixed(50.0)
    }
}

/// Configuration for a backtest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Grid cadence (`"30s"`, `"10min"`, `"1h"`, `"1d"`)
    pub resample_freq: String,

    /// Length of the training window preceding the split (days)
    pub zone_lookback_days: u32,

    /// Volatility multiple over the preceding-quarter median that raises a purple flag
    pub spike_threshold: f64,

    /// Trailing window for the rolling volatility (hours)
    pub volatility_window_hours: f64,

    /// Fixed cost of the API calls needed for one switch
    pub switching_api_cost: f64,

    /// Minutes both pools run concurrently while draining/warming up
    pub overlap_minutes: f64,

    /// Risk scalar at or above which an external prediction flags a pool
    pub decision_threshold: f64,

    /// Forward horizon H for stability labels (ticks)
    pub lookahead_ticks: usize,

    /// Fraction of the grid used for training when `split_at` is unset
    pub train_fraction: f64,

    /// Explicit train/test boundary; ticks at or after it are held out
    pub split_at: Option<DateTime<Utc>>,

    /// Cut-off for the binary `unstable` label
    pub instability_threshold: InstabilityThreshold,

    /// Penalty per stability bucket, most to least severe
    pub stability_penalties: [f64; 5],
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            resample_freq: "10min".to_string(),
            zone_lookback_days: 30,
            spike_threshold: 2.0,
            volatility_window_hours: 6.0,
            switching_api_cost: 0.01,
            overlap_minutes: 5.0,
            decision_threshold: 0.5,
            lookahead_ticks: DEFAULT_LOOKAHEAD_TICKS,
            train_fraction: 0.7,
            split_at: None,
            instability_threshold: InstabilityThreshold::default(),
            stability_penalties: DEFAULT_STABILITY_PENALTIES,
        }
    }
}

impl BacktestConfig {
    /// Load a configuration from a JSON document; missing fields take defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Set grid cadence
    pub fn with_resample_freq(mut self, freq: impl Into<String>) -> Self {
        self.resample_freq = freq.into();
        self
    }

    /// Set training lookback
    pub fn with_zone_lookback_days(mut self, days: u32) -> Self {
        self.zone_lookback_days = days;
        self
    }

    /// Set switching cost parameters
    pub fn with_switching_cost(mut self, api_cost: f64, overlap_minutes: f64) -> Self {
        self.switching_api_cost = api_cost;
        self.overlap_minutes = overlap_minutes;
        self
    }

    /// Set forward horizon for stability labels
    pub fn with_lookahead_ticks(mut self, ticks: usize) -> Self {
        self.lookahead_ticks = ticks;
        self
    }

    /// Set explicit train/test boundary
    pub fn with_split_at(mut self, split_at: DateTime<Utc>) -> Self {
        self.split_at = Some(split_at);
        self
    }

    /// Set train fraction (ignored when `split_at` is set)
    pub fn with_train_fraction(mut self, fraction: f64) -> Self {
        self.train_fraction = fraction;
        self
    }

    /// Set risk decision threshold
    pub fn with_decision_threshold(mut self, threshold: f64) -> Self {
        self.decision_threshold = threshold;
        self
    }

    /// Set purple-flag spike multiple
    pub fn with_spike_threshold(mut self, threshold: f64) -> Self {
        self.spike_threshold = threshold;
        self
    }

    /// Grid cadence as a duration
    pub fn cadence(&self) -> Result<TimeDelta> {
        parse_cadence(&self.resample_freq)
    }

    /// Number of ticks in the rolling volatility window (at least 2)
    pub fn volatility_window_ticks(&self) -> Result<usize> {
        let cadence_secs = self.cadence()?.num_seconds() as f64;
        let window_secs = self.volatility_window_hours * 3600.0;
        Ok(((window_secs / cadence_secs).round() as usize).max(2))
    }

    /// Check every field; fails fast on the first invalid one
    pub fn validate(&self) -> Result<()> {
        self.cadence()?;

        let non_negative = [
            ("spike_threshold", self.spike_threshold),
            ("switching_api_cost", self.switching_api_cost),
            ("overlap_minutes", self.overlap_minutes),
            ("decision_threshold", self.decision_threshold),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(BacktestError::config(format!(
                    "{} must be a non-negative number, got {}",
                    name, value
                )));
            }
        }

        if !(self.volatility_window_hours > 0.0) {
            return Err(BacktestError::config(format!(
                "volatility_window_hours must be positive, got {}",
                self.volatility_window_hours
            )));
        }
        if self.zone_lookback_days == 0 {
            return Err(BacktestError::config("zone_lookback_days must be at least 1"));
        }
        if self.lookahead_ticks == 0 {
            return Err(BacktestError::config("lookahead_ticks must be at least 1"));
        }
        if self.split_at.is_none() && !(self.train_fraction > 0.0 && self.train_fraction < 1.0) {
            return Err(BacktestError::config(format!(
                "train_fraction must be in (0, 1), got {}",
                self.train_fraction
            )));
        }
        match self.instability_threshold {
            InstabilityThreshold::Fixed(score) if !(0.0..=100.0).contains(&score) => {
                return Err(BacktestError::config(format!(
                    "fixed instability threshold must be in [0, 100], got {}",
                    score
                )));
            }
            InstabilityThreshold::Percentile(p) if !(0.0..=100.0).contains(&p) => {
                return Err(BacktestError::config(format!(
                    "instability percentile must be in [0, 100], got {}",
                    p
                )));
            }
            _ => {}
        }
        if self.stability_penalties.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(BacktestError::config("stability_penalties must be non-negative"));
        }

        Ok(())
    }
}

/// Parse a cadence string such as `"10min"`, `"1h"`, `"30s"` or `"1d"`
pub fn parse_cadence(freq: &str) -> Result<TimeDelta> {
    let freq = freq.trim();
    let split = freq
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(freq.len());
    let (digits, unit) = freq.split_at(split);

    let amount: i64 = digits
        .parse()
        .map_err(|_| BacktestError::config(format!("invalid resample_freq '{}'", freq)))?;
    if amount <= 0 {
        return Err(BacktestError::config(format!(
            "resample_freq must be positive, got '{}'",
            freq
        )));
    }

    let delta = match unit.trim() {
        "s" | "sec" => TimeDelta::seconds(amount),
        "min" | "m" | "T" => TimeDelta::minutes(amount),
        "h" | "H" => TimeDelta::hours(amount),
        "d" | "D" => TimeDelta::days(amount),
        other => {
            return Err(BacktestError::config(format!(
                "unknown resample_freq unit '{}' in '{}'",
                other, freq
            )));
        }
    };

    Ok(delta)
}
