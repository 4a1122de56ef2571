//! Hierarchical cross-pool features
//!
//! At every tick each pool's price position (spot / on-demand) is ranked
//! against four nested peer groups, all evaluated at that same tick:
//!
//! ```text
//! global ⊃ family (m5.*)      ⊃ peer (m5.* in us-east-1a)
//!        ⊃ zone   (*@us-east-1a)
//! ```
//!
//! `family_stress` is the mean price position of the whole family at the tick.
//! A quiet pool whose siblings are running hot therefore inherits their risk.
//!
//! Group membership is resolved once into integer keys; each tick is then a
//! single grouped reduction over the pools present in that tick's snapshot.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::stats::percentile_rank;
use crate::sync::{MarketGrid, MarketSnapshot};
use crate::types::PoolId;

/// Features of one pool at one tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub global_pct: f64,
    pub family_pct: f64,
    pub az_pct: f64,
    pub peer_pct: f64,
    pub family_stress: f64,
    /// Other pools of the same family in the same zone
    pub peer_count: usize,
}

/// Exported feature row with its keys
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HierarchicalFeatureRow {
    pub pool_id: PoolId,
    pub timestamp: DateTime<Utc>,
    pub global_pct: f64,
    pub family_pct: f64,
    pub az_pct: f64,
    pub peer_pct: f64,
    pub family_stress: f64,
    pub peer_count: usize,
}

/// Group keys for every pool, resolved once per grid
#[derive(Debug, Clone)]
pub struct FeatureEngine {
    family_of: Vec<usize>,
    az_of: Vec<usize>,
    peer_of: Vec<usize>,
    n_families: usize,
    n_azs: usize,
    n_peers: usize,
}

impl FeatureEngine {
    pub fn new(grid: &MarketGrid) -> Self {
        let mut families = BTreeMap::new();
        let mut azs = BTreeMap::new();
        let mut peers = BTreeMap::new();

        let mut family_of = Vec::with_capacity(grid.pools().len());
        let mut az_of = Vec::with_capacity(grid.pools().len());
        let mut peer_of = Vec::with_capacity(grid.pools().len());

        for pool in grid.pools() {
            let next = families.len();
            family_of.push(*families.entry(pool.family.as_str()).or_insert(next));
            let next = azs.len();
            az_of.push(*azs.entry(pool.az.as_str()).or_insert(next));
            let next = peers.len();
            peer_of.push(*peers.entry((pool.family.as_str(), pool.az.as_str())).or_insert(next));
        }

        FeatureEngine {
            family_of,
            az_of,
            peer_of,
            n_families: families.len(),
            n_azs: azs.len(),
            n_peers: peers.len(),
        }
    }

    /// Family key of a pool
    pub fn family_of(&self, pool: usize) -> usize {
        self.family_of[pool]
    }

    /// Features for every pool present in the snapshot, indexed by pool.
    ///
    /// Reads nothing but the snapshot.
    pub fn compute_tick(&self, snapshot: MarketSnapshot<'_>) -> Vec<Option<FeatureRow>> {
        let n_pools = self.family_of.len();
        let mut out = vec![None; n_pools];
        self.compute_tick_into(snapshot, &mut out);
        out
    }

    /// Mean family price position for each family at the snapshot (`NaN` if absent)
    pub fn family_stress(&self, snapshot: MarketSnapshot<'_>) -> Vec<f64> {
        let mut sum = vec![0.0; self.n_families];
        let mut count = vec![0usize; self.n_families];
        for (pool, _, point) in snapshot.iter() {
            let f = self.family_of[pool];
            sum[f] += point.price_position();
            count[f] += 1;
        }
        sum.iter()
            .zip(&count)
            .map(|(s, c)| if *c == 0 { f64::NAN } else { s / *c as f64 })
            .collect()
    }

    fn compute_tick_into(&self, snapshot: MarketSnapshot<'_>, out: &mut [Option<FeatureRow>]) {
        let present: Vec<(usize, f64)> = snapshot
            .iter()
            .map(|(pool, _, point)| (pool, point.price_position()))
            .collect();
        if present.is_empty() {
            return;
        }

        let global = sorted(present.iter().map(|(_, v)| *v));
        let family = self.grouped(&present, &self.family_of, self.n_families);
        let az = self.grouped(&present, &self.az_of, self.n_azs);
        let peer = self.grouped(&present, &self.peer_of, self.n_peers);

        for &(pool, value) in &present {
            let family_values = &family[self.family_of[pool]];
            let peer_values = &peer[self.peer_of[pool]];
            let family_stress = family_values.iter().sum::<f64>() / family_values.len() as f64;

            out[pool] = Some(FeatureRow {
                global_pct: percentile_rank(&global, value),
                family_pct: percentile_rank(family_values, value),
                az_pct: percentile_rank(&az[self.az_of[pool]], value),
                peer_pct: percentile_rank(peer_values, value),
                family_stress,
                peer_count: peer_values.len() - 1,
            });
        }
    }

    /// Sorted values per group key
    fn grouped(&self, present: &[(usize, f64)], key_of: &[usize], n_groups: usize) -> Vec<Vec<f64>> {
        let mut groups = vec![Vec::new(); n_groups];
        for &(pool, value) in present {
            groups[key_of[pool]].push(value);
        }
        for group in &mut groups {
            group.sort_by(f64::total_cmp);
        }
        groups
    }
}

fn sorted(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut out: Vec<f64> = values.collect();
    out.sort_by(f64::total_cmp);
    out
}

/// Dense tick-major feature table for the whole grid
#[derive(Debug, Clone)]
pub struct FeatureTable {
    n_pools: usize,
    rows: Vec<Option<FeatureRow>>,
}

impl FeatureTable {
    /// Compute features for every tick; ticks are independent and run in parallel
    pub fn build(engine: &FeatureEngine, grid: &MarketGrid) -> Self {
        let n_pools = grid.pools().len();
        let mut rows = vec![None; n_pools * grid.len()];

        if n_pools > 0 {
            rows.par_chunks_mut(n_pools)
                .enumerate()
                .for_each(|(tick, out)| engine.compute_tick_into(grid.snapshot(tick), out));
        }

        debug!(
            "Built feature table: {} rows",
            rows.iter().filter(|r| r.is_some()).count()
        );

        FeatureTable { n_pools, rows }
    }

    pub fn get(&self, pool: usize, tick: usize) -> Option<&FeatureRow> {
        self.rows
            .get(tick * self.n_pools + pool)
            .and_then(Option::as_ref)
    }

    /// Rows with their keys, tick-major then pool order
    pub fn export<'a>(&'a self, grid: &'a MarketGrid) -> impl Iterator<Item = HierarchicalFeatureRow> + 'a {
        self.rows.iter().enumerate().filter_map(move |(i, row)| {
            let row = row.as_ref()?;
            let (tick, pool) = (i / self.n_pools, i % self.n_pools);
            Some(HierarchicalFeatureRow {
                pool_id: grid.pool(pool).id.clone(),
                timestamp: grid.timestamp(tick),
                global_pct: row.global_pct,
                family_pct: row.family_pct,
                az_pct: row.az_pct,
                peer_pct: row.peer_pct,
                family_stress: row.family_stress,
                peer_count: row.peer_count,
            })
        })
    }
}
