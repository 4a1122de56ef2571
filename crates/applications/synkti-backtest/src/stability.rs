//! Stability labels for offline training
//!
//! A label summarizes the *future* window `(t, t+H]` of a pool into a score in
//! `[0, 100]` (100 = perfectly stable). It is a training target only; the
//! simulator never reads it.
//!
//! ## Algorithm
//!
//! 1. For every (pool, tick) with a full forward window compute four metrics:
//!    minimum discount, volatility ratio, discount drop and normalized trend.
//! 2. From train-split windows only, take the 5/10/20/30/50th percentile of
//!    each metric (mirrored 95/90/80/70/50th where high values are bad).
//! 3. Bucket every window against those cutoffs, apply the fixed penalty of
//!    the worst bucket hit, sum across metrics and clip `100 - penalty` to
//!    `[0, 100]`.
//!
//! The last `H` ticks of every series have no full window and get no label.

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{BacktestConfig, InstabilityThreshold};
use crate::signals::ScoreTable;
use crate::stats::{mean, ols_slope, percentile_sorted, sample_std, sorted_finite};
use crate::sync::MarketGrid;
use crate::types::{PoolId, PricePoint};

/// Percentiles for metrics where low values are bad, most to least severe
const LOW_IS_BAD_PERCENTILES: [f64; 5] = [5.0, 10.0, 20.0, 30.0, 50.0];

/// Mirror of [`LOW_IS_BAD_PERCENTILES`] for metrics where high values are bad
const HIGH_IS_BAD_PERCENTILES: [f64; 5] = [95.0, 90.0, 80.0, 70.0, 50.0];

/// Which tail of a metric's distribution is penalized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    LowIsBad,
    HighIsBad,
}

/// Forward-window metrics, in [`METRICS`] order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForwardMetrics {
    /// Lowest discount vs on-demand over the window
    pub min_discount: f64,
    /// Std-dev / mean of the spot price over the window
    pub volatility_ratio: f64,
    /// Current discount minus the lowest future discount
    pub discount_drop: f64,
    /// Per-tick OLS slope of the spot price, relative to the current price
    pub trend: f64,
}

/// Metric names and directions, in [`ForwardMetrics::values`] order
pub const METRICS: [(&str, Direction); 4] = [
    ("min_discount", Direction::LowIsBad),
    ("volatility_ratio", Direction::HighIsBad),
    ("discount_drop", Direction::HighIsBad),
    ("trend", Direction::HighIsBad),
];

impl ForwardMetrics {
    /// Metrics of the window following `current`
    pub fn compute(current: &PricePoint, window: &[PricePoint]) -> Option<Self> {
        if window.is_empty() {
            return None;
        }
        let spot: Vec<f64> = window.iter().map(|p| p.spot_price).collect();

        let min_discount = window
            .iter()
            .map(PricePoint::discount)
            .fold(f64::INFINITY, f64::min);

        let volatility_ratio = match (sample_std(&spot), mean(&spot)) {
            (Some(std), Some(m)) if m > 0.0 => std / m,
            _ => 0.0,
        };

        let slope = ols_slope(&spot).unwrap_or(0.0);
        let trend = if current.spot_price > 0.0 {
            slope / current.spot_price
        } else {
            slope
        };

        Some(ForwardMetrics {
            min_discount,
            volatility_ratio,
            discount_drop: current.discount() - min_discount,
            trend,
        })
    }

    pub fn values(&self) -> [f64; 4] {
        [
            self.min_discount,
            self.volatility_ratio,
            self.discount_drop,
            self.trend,
        ]
    }
}

/// Which side of the train/test boundary a label belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelSplit {
    /// Tick and its whole window precede the split
    Train,
    /// Tick precedes the split but its window crosses it; usable as neither
    Boundary,
    /// Tick is held out
    Test,
}

/// Stability training target for one pool at one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityLabel {
    pub pool_id: PoolId,
    pub timestamp: DateTime<Utc>,
    pub score: f64,
    pub unstable: bool,
    pub split: LabelSplit,
}

/// Train-split cutoffs for each metric plus the instability cut-off
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityThresholds {
    /// `cutoffs[m]` are metric `m`'s percentiles, most to least severe
    pub cutoffs: [[f64; 5]; 4],
    /// Scores below this are labeled unstable
    pub instability_cutoff: f64,
    /// Train windows the cutoffs were computed from
    pub train_windows: usize,
}

/// Fits thresholds on the train split and labels every full window
#[derive(Debug, Clone)]
pub struct StabilityScorer {
    horizon: usize,
    penalties: [f64; 5],
    instability: InstabilityThreshold,
}

impl StabilityScorer {
    pub fn new(horizon: usize, penalties: [f64; 5], instability: InstabilityThreshold) -> Self {
        Self {
            horizon,
            penalties,
            instability,
        }
    }

    pub fn from_config(config: &BacktestConfig) -> Self {
        Self::new(
            config.lookahead_ticks,
            config.stability_penalties,
            config.instability_threshold,
        )
    }

    pub fn horizon(&self) -> usize {
        self.horizon
    }

    /// Metrics for every tick of a pool that has a full window, as `(tick, metrics)`
    fn pool_metrics(&self, grid: &MarketGrid, pool: usize, last_tick: usize) -> Vec<(usize, ForwardMetrics)> {
        let column = grid.column(pool);
        let h = self.horizon;
        // Labels need ticks t+1..=t+H inside both the grid and `last_tick`
        let end = last_tick.min(grid.len()).saturating_sub(h);

        (column.first_tick..end)
            .filter_map(|tick| {
                let offset = tick - column.first_tick;
                let current = &column.points[offset];
                let window = &column.points[offset + 1..=offset + h];
                ForwardMetrics::compute(current, window).map(|m| (tick, m))
            })
            .collect()
    }

    /// Fit cutoffs from windows lying entirely before `split_tick`
    pub fn fit(&self, grid: &MarketGrid, split_tick: usize) -> StabilityThresholds {
        let train: Vec<ForwardMetrics> = (0..grid.pools().len())
            .into_par_iter()
            .flat_map_iter(|pool| {
                self.pool_metrics(grid, pool, split_tick)
                    .into_iter()
                    .map(|(_, m)| m)
            })
            .collect();

        let mut cutoffs = [[f64::NAN; 5]; 4];
        for (m, (_, direction)) in METRICS.iter().enumerate() {
            let sorted = sorted_finite(train.iter().map(|t| t.values()[m]));
            let percentiles = match direction {
                Direction::LowIsBad => LOW_IS_BAD_PERCENTILES,
                Direction::HighIsBad => HIGH_IS_BAD_PERCENTILES,
            };
            for (b, pct) in percentiles.iter().enumerate() {
                cutoffs[m][b] = percentile_sorted(&sorted, *pct).unwrap_or(f64::NAN);
            }
        }

        let mut thresholds = StabilityThresholds {
            cutoffs,
            instability_cutoff: 0.0,
            train_windows: train.len(),
        };

        thresholds.instability_cutoff = match self.instability {
            InstabilityThreshold::Fixed(score) => score,
            InstabilityThreshold::Percentile(pct) => {
                let scores = sorted_finite(train.iter().map(|m| self.score(&thresholds, m)));
                percentile_sorted(&scores, pct).unwrap_or(0.0)
            }
        };

        info!(
            "Fitted stability thresholds from {} train windows (H = {}, instability cutoff {:.1})",
            thresholds.train_windows, self.horizon, thresholds.instability_cutoff
        );

        thresholds
    }

    /// Penalty-based score of one window against fitted cutoffs
    pub fn score(&self, thresholds: &StabilityThresholds, metrics: &ForwardMetrics) -> f64 {
        let values = metrics.values();
        let penalty: f64 = METRICS
            .iter()
            .enumerate()
            .map(|(m, (_, direction))| {
                let value = values[m];
                let bucket = thresholds.cutoffs[m].iter().position(|cut| match direction {
                    Direction::LowIsBad => value < *cut,
                    Direction::HighIsBad => value > *cut,
                });
                bucket.map(|b| self.penalties[b]).unwrap_or(0.0)
            })
            .sum();

        (100.0 - penalty).clamp(0.0, 100.0)
    }

    /// Label every (pool, tick) that has a full forward window
    pub fn label(
        &self,
        grid: &MarketGrid,
        thresholds: &StabilityThresholds,
        split_tick: usize,
    ) -> Vec<StabilityLabel> {
        let labels: Vec<StabilityLabel> = (0..grid.pools().len())
            .into_par_iter()
            .flat_map_iter(|pool| {
                let pool_id = &grid.pool(pool).id;
                self.pool_metrics(grid, pool, grid.len())
                    .into_iter()
                    .map(move |(tick, metrics)| {
                        let score = self.score(thresholds, &metrics);
                        let split = if tick + self.horizon < split_tick {
                            LabelSplit::Train
                        } else if tick < split_tick {
                            LabelSplit::Boundary
                        } else {
                            LabelSplit::Test
                        };
                        StabilityLabel {
                            pool_id: pool_id.clone(),
                            timestamp: grid.timestamp(tick),
                            score,
                            unstable: score < thresholds.instability_cutoff,
                            split,
                        }
                    })
            })
            .collect();

        debug!("Generated {} stability labels", labels.len());
        labels
    }
}

/// Error of an external scorer against held-out labels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeldOutError {
    pub count: usize,
    pub mae: f64,
    pub rmse: f64,
    /// `None` when held-out labels have no variance
    pub r_squared: Option<f64>,
}

/// Compare predicted scores with test-split labels.
///
/// Only labels with a prediction at the same pool and timestamp count.
/// Returns `None` when nothing overlaps.
pub fn evaluate_held_out(labels: &[StabilityLabel], predicted: &ScoreTable) -> Option<HeldOutError> {
    let pairs: Vec<(f64, f64)> = labels
        .iter()
        .filter(|l| l.split == LabelSplit::Test)
        .filter_map(|l| predicted.get(&l.pool_id, l.timestamp).map(|p| (l.score, p)))
        .collect();
    if pairs.is_empty() {
        return None;
    }

    let n = pairs.len() as f64;
    let mae = pairs.iter().map(|(y, p)| (y - p).abs()).sum::<f64>() / n;
    let ss_res: f64 = pairs.iter().map(|(y, p)| (y - p).powi(2)).sum();
    let y_mean = pairs.iter().map(|(y, _)| y).sum::<f64>() / n;
    let ss_tot: f64 = pairs.iter().map(|(y, _)| (y - y_mean).powi(2)).sum();

    Some(HeldOutError {
        count: pairs.len(),
        mae,
        rmse: (ss_res / n).sqrt(),
        r_squared: (ss_tot > 0.0).then(|| 1.0 - ss_res / ss_tot),
    })
}
