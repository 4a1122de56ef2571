//! Snapshot synchronization
//!
//! Turns the irregular per-pool feed into a regular multi-pool grid so every
//! downstream computation compares pools on identical timestamps.
//!
//! ## Semantics
//!
//! The value of a pool at tick `t` is its latest observation with timestamp
//! `<= t` (an as-of join). Gaps are forward-filled from the last observation;
//! ticks before a pool's first observation have no entry (never back-filled).
//!
//! ## Layout
//!
//! ```text
//! pool 0: [first_tick = 0] p p p p p p p p
//! pool 1: [first_tick = 3]       p p p p p
//! pool 2: [first_tick = 1]   p p p p p p p
//!          tick 0 ─────────────────────▶ tick n
//! ```
//!
//! Each pool column is built in one merge pass over its sorted series, so the
//! whole grid costs O(observations + pools × ticks). Looking up "all pools at
//! tick t" is O(pools) and never touches the raw feed.

use chrono::{DateTime, TimeDelta, Utc};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::error::{BacktestError, Result};
use crate::feed::Feed;
use crate::types::{Pool, PoolId, PricePoint};

/// Forward-filled prices for one pool, contiguous from its first tick to the end of the grid
#[derive(Debug, Clone)]
pub struct PoolColumn {
    /// First tick at which the pool has an entry
    pub first_tick: usize,
    /// `points[k]` is the last-known price at tick `first_tick + k`
    pub points: Vec<PricePoint>,
}

impl PoolColumn {
    /// Price at a tick, `None` before the first observation
    pub fn at(&self, tick: usize) -> Option<&PricePoint> {
        tick.checked_sub(self.first_tick)
            .and_then(|offset| self.points.get(offset))
    }
}

/// Tick-indexed, pool-keyed price table
#[derive(Debug, Clone)]
pub struct MarketGrid {
    cadence: TimeDelta,
    timestamps: Vec<DateTime<Utc>>,
    pools: Vec<Pool>,
    columns: Vec<PoolColumn>,
}

impl MarketGrid {
    /// Synchronize a feed onto a fixed-cadence grid.
    ///
    /// Pools whose first observation falls after the last tick are dropped.
    pub fn synchronize(feed: &Feed, cadence: TimeDelta) -> Result<Self> {
        let step = cadence.num_seconds();
        if step <= 0 {
            return Err(BacktestError::config(format!(
                "grid cadence must be at least one second, got {}",
                cadence
            )));
        }

        let (first, last) = feed.time_range();
        let start = floor_to(first, step)?;
        let end = floor_to(last, step)?;
        let n_ticks = ((end - start).num_seconds() / step) as usize + 1;

        let timestamps: Vec<DateTime<Utc>> = (0..n_ticks)
            .map(|k| start + TimeDelta::seconds(step * k as i64))
            .collect();

        let columns: Vec<Option<PoolColumn>> = feed
            .series()
            .par_iter()
            .map(|series| build_column(series, &timestamps))
            .collect();

        let mut pools = Vec::with_capacity(columns.len());
        let mut kept = Vec::with_capacity(columns.len());
        for (pool, column) in feed.pools().iter().zip(columns) {
            match column {
                Some(column) => {
                    pools.push(pool.clone());
                    kept.push(column);
                }
                None => debug!("Pool {} has no observation on the grid, excluded", pool.id),
            }
        }

        info!(
            "Synchronized {} pools onto {} ticks ({} cadence) from {} to {}",
            pools.len(),
            n_ticks,
            cadence,
            start,
            end
        );

        Ok(MarketGrid {
            cadence,
            timestamps,
            pools,
            columns: kept,
        })
    }

    /// Number of ticks
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn cadence(&self) -> TimeDelta {
        self.cadence
    }

    /// Tick length in hours (for cost accrual)
    pub fn tick_hours(&self) -> f64 {
        self.cadence.num_seconds() as f64 / 3600.0
    }

    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    pub fn timestamp(&self, tick: usize) -> DateTime<Utc> {
        self.timestamps[tick]
    }

    /// Pools in lexicographic id order; the index is the pool key everywhere else
    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn pool(&self, pool: usize) -> &Pool {
        &self.pools[pool]
    }

    /// Index of a pool id
    pub fn pool_index(&self, id: &PoolId) -> Option<usize> {
        self.pools.binary_search_by(|p| p.id.cmp(id)).ok()
    }

    /// Index of a pool id, failing with context if absent
    pub fn require_pool(&self, id: &PoolId) -> Result<usize> {
        self.pool_index(id)
            .ok_or_else(|| BacktestError::UnknownPool(id.to_string()))
    }

    pub fn column(&self, pool: usize) -> &PoolColumn {
        &self.columns[pool]
    }

    /// Last-known price of a pool at a tick
    pub fn price(&self, pool: usize, tick: usize) -> Option<&PricePoint> {
        self.columns[pool].at(tick)
    }

    /// First tick whose timestamp is at or after `at`
    pub fn tick_at_or_after(&self, at: DateTime<Utc>) -> usize {
        self.timestamps.partition_point(|ts| *ts < at)
    }

    /// Read-only view of every pool at one tick
    pub fn snapshot(&self, tick: usize) -> MarketSnapshot<'_> {
        MarketSnapshot { grid: self, tick }
    }
}

/// Borrowed view of the grid at one tick.
///
/// Indexes into the grid; owns nothing.
#[derive(Debug, Clone, Copy)]
pub struct MarketSnapshot<'a> {
    grid: &'a MarketGrid,
    tick: usize,
}

impl<'a> MarketSnapshot<'a> {
    pub fn tick(&self) -> usize {
        self.tick
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.grid.timestamps[self.tick]
    }

    pub fn pool(&self, pool: usize) -> &'a Pool {
        &self.grid.pools[pool]
    }

    /// Last-known price of a pool, `None` before its first observation
    pub fn get(&self, pool: usize) -> Option<&'a PricePoint> {
        self.grid.columns[pool].at(self.tick)
    }

    /// Pools with an entry at this tick, in pool order
    pub fn iter(self) -> impl Iterator<Item = (usize, &'a Pool, &'a PricePoint)> + 'a {
        let tick = self.tick;
        let grid = self.grid;
        grid.pools
            .iter()
            .zip(grid.columns.iter())
            .enumerate()
            .filter_map(move |(idx, (pool, column))| column.at(tick).map(|p| (idx, pool, p)))
    }
}

fn floor_to(ts: DateTime<Utc>, step: i64) -> Result<DateTime<Utc>> {
    let secs = ts.timestamp().div_euclid(step) * step;
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| BacktestError::config(format!("timestamp {} out of range", ts)))
}

/// Merge one pool's sorted series onto the grid
fn build_column(series: &[PricePoint], timestamps: &[DateTime<Utc>]) -> Option<PoolColumn> {
    let first_obs = series.first()?.timestamp;
    // First tick that can see the first observation
    let first_tick = timestamps.partition_point(|ts| *ts < first_obs);
    if first_tick >= timestamps.len() {
        return None;
    }

    let mut points = Vec::with_capacity(timestamps.len() - first_tick);
    let mut j = 0;
    for tick_ts in &timestamps[first_tick..] {
        while j + 1 < series.len() && series[j + 1].timestamp <= *tick_ts {
            j += 1;
        }
        points.push(series[j]);
    }

    Some(PoolColumn { first_tick, points })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FeedRecord;
    use chrono::TimeZone;

    fn at(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + TimeDelta::minutes(min)
    }

    #[test]
    fn test_forward_fill_between_observations() {
        let feed = Feed::from_records(vec![
            FeedRecord::new(at(0), "m5.large", "us-east-1a", 0.10, 1.0),
            FeedRecord::new(at(30), "m5.large", "us-east-1a", 0.20, 1.0),
        ])
        .unwrap();
        let grid = MarketGrid::synchronize(&feed, TimeDelta::minutes(10)).unwrap();

        assert_eq!(grid.len(), 4);
        let prices: Vec<f64> = (0..4).map(|t| grid.price(0, t).unwrap().spot_price).collect();
        assert_eq!(prices, vec![0.10, 0.10, 0.10, 0.20]);
    }

    #[test]
    fn test_no_back_fill_before_first_observation() {
        let feed = Feed::from_records(vec![
            FeedRecord::new(at(0), "c5.large", "us-east-1a", 0.05, 1.0),
            FeedRecord::new(at(40), "c5.large", "us-east-1a", 0.05, 1.0),
            FeedRecord::new(at(20), "m5.large", "us-east-1a", 0.10, 1.0),
        ])
        .unwrap();
        let grid = MarketGrid::synchronize(&feed, TimeDelta::minutes(10)).unwrap();

        let m5 = grid.pool_index(&PoolId::from("m5.large@us-east-1a")).unwrap();
        assert!(grid.price(m5, 0).is_none());
        assert!(grid.price(m5, 1).is_none());
        assert_eq!(grid.price(m5, 2).unwrap().spot_price, 0.10);
        assert_eq!(grid.column(m5).first_tick, 2);
        assert_eq!(grid.snapshot(1).iter().count(), 1);
        assert_eq!(grid.snapshot(2).iter().count(), 2);
    }

    #[test]
    fn test_off_grid_observation_visible_at_next_tick() {
        let feed = Feed::from_records(vec![
            FeedRecord::new(at(0), "m5.large", "us-east-1a", 0.10, 1.0),
            FeedRecord::new(at(15), "m5.large", "us-east-1a", 0.30, 1.0),
            FeedRecord::new(at(20), "m5.large", "us-east-1a", 0.40, 1.0),
        ])
        .unwrap();
        let grid = MarketGrid::synchronize(&feed, TimeDelta::minutes(10)).unwrap();

        // 00:10 must not see the 00:15 observation
        assert_eq!(grid.price(0, 1).unwrap().spot_price, 0.10);
        assert_eq!(grid.price(0, 2).unwrap().spot_price, 0.40);
    }

    #[test]
    fn test_grid_floors_to_cadence() {
        let feed = Feed::from_records(vec![
            FeedRecord::new(at(3), "m5.large", "us-east-1a", 0.10, 1.0),
            FeedRecord::new(at(27), "m5.large", "us-east-1a", 0.20, 1.0),
        ])
        .unwrap();
        let grid = MarketGrid::synchronize(&feed, TimeDelta::minutes(10)).unwrap();

        assert_eq!(grid.timestamp(0), at(0));
        assert_eq!(grid.len(), 3);
        // First observation at 00:03 is first visible at 00:10
        assert_eq!(grid.column(0).first_tick, 1);
        assert_eq!(grid.price(0, 2).unwrap().spot_price, 0.10);
    }

    #[test]
    fn test_pool_after_last_tick_excluded() {
        let feed = Feed::from_records(vec![
            FeedRecord::new(at(0), "c5.large", "us-east-1a", 0.05, 1.0),
            FeedRecord::new(at(20), "c5.large", "us-east-1a", 0.05, 1.0),
            FeedRecord::new(at(25), "m5.large", "us-east-1a", 0.10, 1.0),
        ])
        .unwrap();
        let grid = MarketGrid::synchronize(&feed, TimeDelta::minutes(10)).unwrap();

        assert_eq!(grid.pools().len(), 1);
        assert!(grid.pool_index(&PoolId::from("m5.large@us-east-1a")).is_none());
        assert!(grid.require_pool(&PoolId::from("m5.large@us-east-1a")).is_err());
    }

    #[test]
    fn test_tick_lookup() {
        let feed = Feed::from_records(vec![
            FeedRecord::new(at(0), "m5.large", "us-east-1a", 0.10, 1.0),
            FeedRecord::new(at(50), "m5.large", "us-east-1a", 0.20, 1.0),
        ])
        .unwrap();
        let grid = MarketGrid::synchronize(&feed, TimeDelta::minutes(10)).unwrap();

        assert_eq!(grid.tick_at_or_after(at(20)), 2);
        assert_eq!(grid.tick_at_or_after(at(21)), 3);
        assert_eq!(grid.tick_at_or_after(at(90)), grid.len());
        assert!((grid.tick_hours() - 10.0 / 60.0).abs() < 1e-12);
    }
}
