//! Zone thresholds and purple volatility flags
//!
//! ## Static bands
//!
//! Each pool gets four price cutoffs computed once over the training window
//! and frozen for the rest of the timeline:
//!
//! | Zone   | Cutoff            |
//! |--------|-------------------|
//! | green  | P70               |
//! | yellow | P90               |
//! | orange | P95               |
//! | red    | max × 1.10        |
//!
//! Nothing outside the training window is read, so test-period content
//! cannot move a threshold.
//!
//! ## Purple flag
//!
//! Rolling volatility (sample std-dev over a trailing window) is compared to
//! the median volatility of the pool's *preceding* calendar quarter. A tick in
//! quarter `Q` is purple when its volatility exceeds `spike_threshold` times
//! that baseline. The first quarter of every pool has no baseline and is never
//! flagged.

use chrono::{DateTime, Datelike, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::stats::{median, percentile_sorted, rolling_sample_std, sorted_finite};
use crate::sync::MarketGrid;
use crate::types::{PoolId, Zone};

/// Red cutoff headroom over the training maximum
pub const RED_HEADROOM: f64 = 1.10;

/// Half-open tick range `[start, end)` of the training data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainWindow {
    pub start: usize,
    pub end: usize,
}

impl TrainWindow {
    pub fn contains(&self, tick: usize) -> bool {
        (self.start..self.end).contains(&tick)
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Frozen price cutoffs for one pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneThresholds {
    pub pool_id: PoolId,
    pub green: f64,
    pub yellow: f64,
    pub orange: f64,
    pub red: f64,
    /// Training observations the cutoffs were computed from
    pub training_ticks: usize,
    pub training_min: f64,
    pub training_max: f64,
}

impl ZoneThresholds {
    /// Compute cutoffs from training prices; `None` if there are none
    pub fn from_prices(pool_id: PoolId, prices: impl IntoIterator<Item = f64>) -> Option<Self> {
        let sorted = sorted_finite(prices);
        let max = *sorted.last()?;

        Some(ZoneThresholds {
            pool_id,
            green: percentile_sorted(&sorted, 70.0)?,
            yellow: percentile_sorted(&sorted, 90.0)?,
            orange: percentile_sorted(&sorted, 95.0)?,
            red: max * RED_HEADROOM,
            training_ticks: sorted.len(),
            training_min: sorted[0],
            training_max: max,
        })
    }

    /// Band a price falls into. Anything above orange is red.
    pub fn classify(&self, price: f64) -> Zone {
        if price <= self.green {
            Zone::Green
        } else if price <= self.yellow {
            Zone::Yellow
        } else if price <= self.orange {
            Zone::Orange
        } else {
            Zone::Red
        }
    }

    /// Green, yellow and orange coincide
    pub fn is_collapsed(&self) -> bool {
        self.green == self.yellow || self.yellow == self.orange
    }
}

/// Recoverable data condition, reported and then ignored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Diagnostic {
    /// Training prices never moved
    FlatPrices { pool: PoolId, price: f64 },
    /// Distinct prices but at least two cutoffs coincide
    CollapsedThresholds {
        pool: PoolId,
        green: f64,
        yellow: f64,
        orange: f64,
        min: f64,
        max: f64,
    },
    /// No observation inside the training window
    NoTrainingData { pool: PoolId },
    /// Preceding quarter had no measurable volatility, so no purple baseline
    NoVolatilityBaseline { pool: PoolId, quarter: QuarterId },
}

/// Per-pool static zone model
#[derive(Debug, Clone)]
pub struct ZoneModel {
    window: TrainWindow,
    thresholds: Vec<Option<ZoneThresholds>>,
    diagnostics: Vec<Diagnostic>,
}

impl ZoneModel {
    /// Fit thresholds for every pool from the training window only
    pub fn fit(grid: &MarketGrid, window: TrainWindow) -> Self {
        let end = window.end.min(grid.len());

        let thresholds: Vec<Option<ZoneThresholds>> = (0..grid.pools().len())
            .into_par_iter()
            .map(|pool| {
                let column = grid.column(pool);
                let prices = (window.start..end)
                    .filter_map(|tick| column.at(tick))
                    .map(|p| p.spot_price);
                ZoneThresholds::from_prices(grid.pool(pool).id.clone(), prices)
            })
            .collect();

        let mut diagnostics = Vec::new();
        for (pool, t) in grid.pools().iter().zip(&thresholds) {
            match t {
                None => {
                    warn!("Pool {} has no training data; it will never be a switch target", pool.id);
                    diagnostics.push(Diagnostic::NoTrainingData {
                        pool: pool.id.clone(),
                    });
                }
                Some(t) if t.training_min == t.training_max => {
                    warn!(
                        "Pool {} has flat training prices ({}); green=yellow=orange",
                        pool.id, t.training_min
                    );
                    diagnostics.push(Diagnostic::FlatPrices {
                        pool: pool.id.clone(),
                        price: t.training_min,
                    });
                }
                Some(t) if t.is_collapsed() => {
                    warn!(
                        "Pool {} has collapsed thresholds (range {}..{})",
                        pool.id, t.training_min, t.training_max
                    );
                    diagnostics.push(Diagnostic::CollapsedThresholds {
                        pool: pool.id.clone(),
                        green: t.green,
                        yellow: t.yellow,
                        orange: t.orange,
                        min: t.training_min,
                        max: t.training_max,
                    });
                }
                Some(_) => {}
            }
        }

        debug!(
            "Fitted zone thresholds for {}/{} pools over ticks {}..{}",
            thresholds.iter().filter(|t| t.is_some()).count(),
            thresholds.len(),
            window.start,
            end
        );

        ZoneModel {
            window,
            thresholds,
            diagnostics,
        }
    }

    pub fn window(&self) -> TrainWindow {
        self.window
    }

    pub fn thresholds(&self, pool: usize) -> Option<&ZoneThresholds> {
        self.thresholds.get(pool).and_then(Option::as_ref)
    }

    /// Zone of a price for a pool; `None` if the pool has no thresholds
    pub fn zone(&self, pool: usize, price: f64) -> Option<Zone> {
        self.thresholds(pool).map(|t| t.classify(price))
    }

    /// One row per pool with thresholds, in pool order
    pub fn table(&self) -> impl Iterator<Item = &ZoneThresholds> {
        self.thresholds.iter().flatten()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

/// Calendar quarter (UTC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QuarterId {
    pub year: i32,
    pub quarter: u8,
}

impl QuarterId {
    pub fn of(ts: DateTime<Utc>) -> Self {
        QuarterId {
            year: ts.year(),
            quarter: (ts.month0() / 3 + 1) as u8,
        }
    }
}

impl std::fmt::Display for QuarterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Q{}", self.year, self.quarter)
    }
}

/// One row of the purple flag table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PurpleQuarter {
    pub pool_id: PoolId,
    pub quarter: QuarterId,
    /// Position of this quarter in the pool's own history (0 = first)
    pub quarter_index: usize,
    /// Median volatility of the preceding quarter; `None` for quarter 0
    pub baseline: Option<f64>,
    pub ticks: usize,
    pub flagged_ticks: usize,
}

/// Per-tick purple flags for every pool
#[derive(Debug, Clone)]
pub struct PurpleFlags {
    /// Aligned with each pool's column (`flags[pool][k]` is tick `first_tick + k`)
    flags: Vec<Vec<bool>>,
    first_ticks: Vec<usize>,
    rows: Vec<PurpleQuarter>,
    diagnostics: Vec<Diagnostic>,
}

impl PurpleFlags {
    /// Compute flags over the full timeline.
    ///
    /// `window_ticks` is the trailing volatility window; `spike_threshold` the
    /// multiple of the preceding-quarter median that raises a flag.
    pub fn compute(grid: &MarketGrid, window_ticks: usize, spike_threshold: f64) -> Self {
        let quarters: Vec<QuarterId> = grid.timestamps().iter().map(|ts| QuarterId::of(*ts)).collect();

        let per_pool: Vec<(Vec<bool>, Vec<PurpleQuarter>, Vec<Diagnostic>)> = (0..grid.pools().len())
            .into_par_iter()
            .map(|pool| {
                let column = grid.column(pool);
                let prices: Vec<f64> = column.points.iter().map(|p| p.spot_price).collect();
                let pool_quarters = &quarters[column.first_tick..];
                flag_pool(
                    &grid.pool(pool).id,
                    &prices,
                    pool_quarters,
                    window_ticks,
                    spike_threshold,
                )
            })
            .collect();

        let first_ticks = (0..grid.pools().len())
            .map(|pool| grid.column(pool).first_tick)
            .collect();
        let mut flags = Vec::with_capacity(per_pool.len());
        let mut rows = Vec::new();
        let mut diagnostics = Vec::new();
        for (f, r, d) in per_pool {
            flags.push(f);
            rows.extend(r);
            diagnostics.extend(d);
        }

        debug!(
            "Computed purple flags: {} pool-quarters, {} flagged ticks",
            rows.len(),
            rows.iter().map(|r| r.flagged_ticks).sum::<usize>()
        );

        PurpleFlags {
            flags,
            first_ticks,
            rows,
            diagnostics,
        }
    }

    /// Whether a pool is purple at a tick (false before its first observation)
    pub fn is_flagged(&self, pool: usize, tick: usize) -> bool {
        tick.checked_sub(self.first_ticks[pool])
            .and_then(|offset| self.flags[pool].get(offset))
            .copied()
            .unwrap_or(false)
    }

    /// One row per pool/quarter
    pub fn rows(&self) -> &[PurpleQuarter] {
        &self.rows
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

fn flag_pool(
    pool_id: &PoolId,
    prices: &[f64],
    quarters: &[QuarterId],
    window_ticks: usize,
    spike_threshold: f64,
) -> (Vec<bool>, Vec<PurpleQuarter>, Vec<Diagnostic>) {
    let volatility = rolling_sample_std(prices, window_ticks);
    let mut flags = vec![false; prices.len()];
    let mut rows = Vec::new();
    let mut diagnostics = Vec::new();

    // Contiguous runs of ticks per quarter
    let mut spans: Vec<(QuarterId, usize, usize)> = Vec::new();
    for (i, q) in quarters.iter().enumerate() {
        match spans.last_mut() {
            Some((last, _, end)) if last == q => *end = i + 1,
            _ => spans.push((*q, i, i + 1)),
        }
    }

    let mut previous_baseline: Option<f64> = None;
    for (index, (quarter, start, end)) in spans.iter().enumerate() {
        // A zero baseline (flat preceding quarter) would flag any movement at all
        let baseline = if index == 0 {
            None
        } else {
            previous_baseline.filter(|b| *b > 0.0)
        };

        if index > 0 && baseline.is_none() {
            diagnostics.push(Diagnostic::NoVolatilityBaseline {
                pool: pool_id.clone(),
                quarter: *quarter,
            });
        }

        let mut flagged = 0;
        if let Some(baseline) = baseline {
            let limit = spike_threshold * baseline;
            for i in *start..*end {
                if matches!(volatility[i], Some(v) if v > limit) {
                    flags[i] = true;
                    flagged += 1;
                }
            }
        }

        rows.push(PurpleQuarter {
            pool_id: pool_id.clone(),
            quarter: *quarter,
            quarter_index: index,
            baseline,
            ticks: end - start,
            flagged_ticks: flagged,
        });

        // Baseline for the next quarter comes from this one only
        previous_baseline = median(volatility[*start..*end].iter().flatten().copied());
    }

    (flags, rows, diagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{Feed, FeedRecord};
    use chrono::{TimeDelta, TimeZone};

    fn flat_grid(prices: &[f64], start: DateTime<Utc>, cadence: TimeDelta) -> MarketGrid {
        let records = prices
            .iter()
            .enumerate()
            .map(|(i, p)| {
                FeedRecord::new(start + cadence * i as i32, "m5.large", "us-east-1a", *p, 1.0)
            })
            .collect::<Vec<_>>();
        let feed = Feed::from_records(records).unwrap();
        MarketGrid::synchronize(&feed, cadence).unwrap()
    }

    #[test]
    fn test_thresholds_from_prices() {
        let prices: Vec<f64> = (1..=100).map(|i| i as f64 / 100.0).collect();
        let t = ZoneThresholds::from_prices(PoolId::from("p"), prices).unwrap();

        assert!((t.green - 0.703).abs() < 1e-9);
        assert!((t.yellow - 0.901).abs() < 1e-9);
        assert!((t.orange - 0.9505).abs() < 1e-9);
        assert!((t.red - 1.10).abs() < 1e-9);
        assert_eq!(t.classify(0.5), Zone::Green);
        assert_eq!(t.classify(0.8), Zone::Yellow);
        assert_eq!(t.classify(0.93), Zone::Orange);
        assert_eq!(t.classify(0.99), Zone::Red);
        assert_eq!(t.classify(5.0), Zone::Red);
    }

    #[test]
    fn test_constant_prices_collapse_without_error() {
        let t = ZoneThresholds::from_prices(PoolId::from("p"), vec![2.04; 50]).unwrap();
        assert_eq!(t.green, 2.04);
        assert_eq!(t.yellow, 2.04);
        assert_eq!(t.orange, 2.04);
        assert!((t.red - 2.04 * 1.10).abs() < 1e-12);
        assert_eq!(t.classify(2.04), Zone::Green);
        assert!(t.is_collapsed());
    }

    #[test]
    fn test_empty_prices_have_no_thresholds() {
        assert!(ZoneThresholds::from_prices(PoolId::from("p"), Vec::new()).is_none());
    }

    #[test]
    fn test_zone_model_reports_flat_pool() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let grid = flat_grid(&[2.04; 10], start, TimeDelta::hours(1));
        let model = ZoneModel::fit(&grid, TrainWindow { start: 0, end: 5 });

        assert_eq!(model.table().count(), 1);
        assert!(matches!(model.diagnostics()[0], Diagnostic::FlatPrices { price, .. } if price == 2.04));
        assert_eq!(model.zone(0, 2.04), Some(Zone::Green));
    }

    #[test]
    fn test_zone_model_ignores_test_period() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut prices = vec![0.10, 0.11, 0.12, 0.13, 0.14];
        let base = ZoneModel::fit(&flat_grid(&prices, start, TimeDelta::hours(1)), TrainWindow { start: 0, end: 3 });

        prices[3] = 9.0;
        prices[4] = 0.01;
        let mutated = ZoneModel::fit(&flat_grid(&prices, start, TimeDelta::hours(1)), TrainWindow { start: 0, end: 3 });

        assert_eq!(base.thresholds(0), mutated.thresholds(0));
    }

    #[test]
    fn test_quarter_id() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 17, 0, 0, 0).unwrap();
        assert_eq!(QuarterId::of(ts), QuarterId { year: 2024, quarter: 2 });
        assert_eq!(QuarterId::of(ts).to_string(), "2024Q2");
    }

    #[test]
    fn test_first_quarter_never_flagged() {
        // Wild swings in Q1, calm then wild in Q2
        let start = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();
        let prices: Vec<f64> = (0..96)
            .map(|i| match i {
                0..=23 => if i % 2 == 0 { 0.1 } else { 0.9 },
                24..=71 => 0.10 + 0.001 * (i % 2) as f64,
                _ => if i % 2 == 0 { 0.1 } else { 0.9 },
            })
            .collect();
        let grid = flat_grid(&prices, start, TimeDelta::hours(1));
        let flags = PurpleFlags::compute(&grid, 6, 2.0);

        for tick in 0..24 {
            assert!(!flags.is_flagged(0, tick), "Q1 tick {} must not be flagged", tick);
        }
        let rows = flags.rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].baseline, None);
        assert_eq!(rows[0].flagged_ticks, 0);
        // Q2 baseline is Q1's (large) median volatility, so the calm part of Q2 is not flagged
        assert!(rows[1].baseline.unwrap() > 0.3);
        assert!(!flags.is_flagged(0, 40));
    }

    #[test]
    fn test_spike_over_preceding_quarter_flagged() {
        // Q1 calm with tiny oscillation; Q2 starts calm then spikes
        let start = Utc.with_ymd_and_hms(2024, 3, 30, 0, 0, 0).unwrap();
        let prices: Vec<f64> = (0..96)
            .map(|i| if i < 80 { 0.10 + 0.001 * (i % 2) as f64 } else { 0.10 + 0.05 * (i % 2) as f64 })
            .collect();
        let grid = flat_grid(&prices, start, TimeDelta::hours(1));
        let flags = PurpleFlags::compute(&grid, 6, 2.0);

        // Q1 covers 48 hours (Mar 30-31)
        assert!(!flags.is_flagged(0, 60));
        assert!(flags.is_flagged(0, 85));
        assert!(flags.rows()[1].flagged_ticks > 0);
    }
}
