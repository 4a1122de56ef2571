//! Synthetic spot price feeds using Ornstein-Uhlenbeck processes
//!
//! Each pool's spot price is a mean-reverting process:
//! - pools of the same family share a common shock, so siblings on the same
//!   hardware move together
//! - a daily cycle modulates the price
//! - every pool reports on its own cadence and phase, so the raw feed is
//!   asynchronous the way a scraped price history is
//!
//! Generation is seeded; the same seed yields the same feed.

use chrono::{DateTime, TimeDelta, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tracing::info;

use crate::error::{BacktestError, Result};
use crate::feed::FeedRecord;

/// Simulation step of the underlying processes (minutes)
const STEP_MINUTES: i64 = 5;

const FAMILIES: [(&str, f64); 4] = [("m5", 0.096), ("c5", 0.085), ("r5", 0.126), ("t3", 0.0416)];
const SIZES: [(&str, f64); 3] = [("large", 1.0), ("xlarge", 2.0), ("2xlarge", 4.0)];
const ZONES: [&str; 3] = ["us-east-1a", "us-east-1b", "us-east-1c"];
const REPORT_EVERY_MINUTES: [i64; 4] = [5, 10, 15, 30];

/// Parameters of one synthetic pool
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticPool {
    pub instance_type: String,
    pub availability_zone: String,
    pub on_demand_price: f64,
    /// Long-run mean as a fraction of on-demand
    pub mean_position: f64,
    /// Minutes between reported observations
    pub report_every_minutes: i64,
}

/// Seeded multi-pool feed generator
#[derive(Debug, Clone)]
pub struct SyntheticFeed {
    pools: Vec<SyntheticPool>,
    seed: u64,
    volatility: f64,
    mean_reversion_speed: f64,
    family_shock_volatility: f64,
}

impl SyntheticFeed {
    pub fn new(seed: u64) -> Self {
        SyntheticFeed {
            pools: Vec::new(),
            seed,
            volatility: 0.15,           // per sqrt(hour), relative to on-demand
            mean_reversion_speed: 0.3,  // per hour
            family_shock_volatility: 0.05,
        }
    }

    /// `n_pools` pools drawn over families, sizes and zones
    pub fn standard(n_pools: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut feed = SyntheticFeed::new(seed);

        for i in 0..n_pools {
            let (family, base_price) = FAMILIES[i % FAMILIES.len()];
            let (size, multiplier) = SIZES[(i / FAMILIES.len()) % SIZES.len()];
            let az = ZONES[(i / (FAMILIES.len() * SIZES.len())) % ZONES.len()];
            feed = feed.with_pool(SyntheticPool {
                instance_type: format!("{}.{}", family, size),
                availability_zone: az.to_string(),
                on_demand_price: base_price * multiplier,
                mean_position: rng.gen_range(0.25..0.45),
                report_every_minutes: REPORT_EVERY_MINUTES[rng.gen_range(0..REPORT_EVERY_MINUTES.len())],
            });
        }
        feed
    }

    pub fn with_pool(mut self, pool: SyntheticPool) -> Self {
        self.pools.push(pool);
        self
    }

    /// Set per-pool diffusion (fraction of on-demand per sqrt(hour))
    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = volatility;
        self
    }

    /// Set shared family shock diffusion
    pub fn with_family_shock(mut self, volatility: f64) -> Self {
        self.family_shock_volatility = volatility;
        self
    }

    pub fn pools(&self) -> &[SyntheticPool] {
        &self.pools
    }

    /// Generate records over `[start, start + duration)`, sorted by timestamp
    pub fn generate(&self, start: DateTime<Utc>, duration: TimeDelta) -> Result<Vec<FeedRecord>> {
        if self.pools.is_empty() {
            return Err(BacktestError::config("synthetic feed needs at least one pool"));
        }
        let normal = Normal::new(0.0, 1.0)
            .map_err(|e| BacktestError::config(format!("invalid noise distribution: {}", e)))?;
        let mut rng = StdRng::seed_from_u64(self.seed);

        let steps = (duration.num_minutes() / STEP_MINUTES).max(0) as usize;
        let dt = STEP_MINUTES as f64 / 60.0;

        let families: Vec<&str> = self
            .pools
            .iter()
            .map(|p| p.instance_type.split('.').next().unwrap_or(&p.instance_type))
            .collect();
        let mut family_names: Vec<&str> = families.clone();
        family_names.sort_unstable();
        family_names.dedup();
        let family_of: Vec<usize> = families
            .iter()
            .map(|f| family_names.iter().position(|n| n == f).unwrap_or(0))
            .collect();

        // Observation phase per pool so reports interleave
        let phases: Vec<i64> = self
            .pools
            .iter()
            .map(|p| rng.gen_range(0..(p.report_every_minutes / STEP_MINUTES).max(1)) * STEP_MINUTES)
            .collect();

        let mut positions: Vec<f64> = self.pools.iter().map(|p| p.mean_position).collect();
        let mut shocks = vec![0.0; family_names.len()];
        let mut records = Vec::with_capacity(steps * self.pools.len() / 2);

        for step in 0..steps {
            let minutes = step as i64 * STEP_MINUTES;
            let timestamp = start + TimeDelta::minutes(minutes);
            let hour = minutes as f64 / 60.0;

            // dS = -θ S dt + σ_f dW, shared by a family
            for shock in shocks.iter_mut() {
                let dw = normal.sample(&mut rng) * dt.sqrt();
                *shock += -self.mean_reversion_speed * *shock * dt + self.family_shock_volatility * dw;
            }

            for (i, pool) in self.pools.iter().enumerate() {
                // dX = θ(μ + S - X)dt + σdW
                let target = pool.mean_position + shocks[family_of[i]];
                let dw = normal.sample(&mut rng) * dt.sqrt();
                positions[i] += self.mean_reversion_speed * (target - positions[i]) * dt + self.volatility * dw;

                if (minutes - phases[i]).rem_euclid(pool.report_every_minutes) != 0 || minutes < phases[i] {
                    continue;
                }

                let daily_factor = 1.0 + 0.05 * (2.0 * std::f64::consts::PI * hour / 24.0).sin();
                let position = (positions[i] * daily_factor).clamp(0.1, 0.95);

                records.push(FeedRecord::new(
                    timestamp,
                    pool.instance_type.clone(),
                    pool.availability_zone.clone(),
                    (position * pool.on_demand_price * 10_000.0).round() / 10_000.0,
                    pool.on_demand_price,
                ));
            }
        }

        info!(
            "Generated {} synthetic records for {} pools over {} steps (seed {})",
            records.len(),
            self.pools.len(),
            steps,
            self.seed
        );

        Ok(records)
    }
}
