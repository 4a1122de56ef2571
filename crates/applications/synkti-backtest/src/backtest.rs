//! Backtest pipeline
//!
//! ```text
//! Feed ──► MarketGrid ──┬─► ZoneModel (train window only)
//!                       ├─► PurpleFlags (full timeline, preceding-quarter baselines)
//!                       ├─► FeatureEngine (per-tick aggregates)
//!                       └─► StabilityScorer (offline labels, train-split cutoffs)
//!                                   │
//!        RiskSignal ──────► Simulator runs (one per RunSpec, in parallel)
//! ```
//!
//! Everything upstream of the simulator is computed once in
//! [`Backtest::prepare`] and only read afterwards, so any number of runs can
//! share it.

use std::ops::Range;
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, TimeDelta, Utc};
use rayon::prelude::*;
use tracing::info;

use crate::config::BacktestConfig;
use crate::cost::SwitchingCostModel;
use crate::error::{BacktestError, Result};
use crate::features::{FeatureEngine, FeatureTable};
use crate::feed::Feed;
use crate::policy::{NeverSwitchPolicy, SwitchPolicy, ZoneHeuristicPolicy};
use crate::signals::{NoRiskSignal, RiskSignal, ScoreTable};
use crate::simulator::{SimulationOutcome, Simulator};
use crate::stability::{evaluate_held_out, HeldOutError, StabilityLabel, StabilityScorer, StabilityThresholds};
use crate::sync::MarketGrid;
use crate::types::PoolId;
use crate::zones::{Diagnostic, PurpleFlags, TrainWindow, ZoneModel};

/// One simulator run to perform
pub struct RunSpec {
    pub name: String,
    pub initial_pool: PoolId,
    pub policy: Box<dyn SwitchPolicy>,
    /// Ticks to replay; the test period when `None`
    pub ticks: Option<Range<usize>>,
}

impl RunSpec {
    pub fn new(name: impl Into<String>, initial_pool: PoolId, policy: impl SwitchPolicy + 'static) -> Self {
        RunSpec {
            name: name.into(),
            initial_pool,
            policy: Box::new(policy),
            ticks: None,
        }
    }

    /// Zone heuristic with every trigger enabled
    pub fn heuristic(initial_pool: PoolId) -> Self {
        let name = format!("heuristic:{}", initial_pool);
        Self::new(name, initial_pool, ZoneHeuristicPolicy::new())
    }

    /// Hold the initial pool throughout
    pub fn never_switch(initial_pool: PoolId) -> Self {
        let name = format!("never:{}", initial_pool);
        Self::new(name, initial_pool, NeverSwitchPolicy)
    }

    pub fn with_ticks(mut self, ticks: Range<usize>) -> Self {
        self.ticks = Some(ticks);
        self
    }
}

/// Precomputed market tables plus the configuration they were built with
pub struct Backtest {
    config: BacktestConfig,
    grid: MarketGrid,
    split_tick: usize,
    zones: ZoneModel,
    purple: PurpleFlags,
    features: FeatureEngine,
    stability: StabilityThresholds,
    labels: Vec<StabilityLabel>,
    signal: Box<dyn RiskSignal>,
}

impl Backtest {
    /// Synchronize the feed and compute every per-pool table
    pub fn prepare(feed: &Feed, config: BacktestConfig) -> Result<Self> {
        config.validate()?;
        let grid = MarketGrid::synchronize(feed, config.cadence()?)?;
        let split_tick = split_tick(&grid, &config)?;

        let split_ts = grid.timestamp(split_tick);
        let lookback = TimeDelta::days(config.zone_lookback_days as i64);
        // A lookback reaching before the representable range covers the whole history
        let window = TrainWindow {
            start: split_ts
                .checked_sub_signed(lookback)
                .map_or(0, |from| grid.tick_at_or_after(from)),
            end: split_tick,
        };

        info!(
            "Train window ticks {}..{} ({} to {}), test ticks {}..{}",
            window.start,
            window.end,
            grid.timestamp(window.start),
            split_ts,
            split_tick,
            grid.len()
        );

        let zones = ZoneModel::fit(&grid, window);
        let purple = PurpleFlags::compute(&grid, config.volatility_window_ticks()?, config.spike_threshold);
        let features = FeatureEngine::new(&grid);

        let scorer = StabilityScorer::from_config(&config);
        let stability = scorer.fit(&grid, split_tick);
        let labels = scorer.label(&grid, &stability, split_tick);

        Ok(Backtest {
            config,
            grid,
            split_tick,
            zones,
            purple,
            features,
            stability,
            labels,
            signal: Box::new(NoRiskSignal),
        })
    }

    /// Attach the external risk signal used by trigger (c) and target filtering
    pub fn with_signal(mut self, signal: impl RiskSignal + 'static) -> Self {
        info!("Using risk signal: {}", signal.name());
        self.signal = Box::new(signal);
        self
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn grid(&self) -> &MarketGrid {
        &self.grid
    }

    /// First held-out tick
    pub fn split_tick(&self) -> usize {
        self.split_tick
    }

    pub fn split_at(&self) -> DateTime<Utc> {
        self.grid.timestamp(self.split_tick)
    }

    pub fn test_ticks(&self) -> Range<usize> {
        self.split_tick..self.grid.len()
    }

    pub fn zones(&self) -> &ZoneModel {
        &self.zones
    }

    pub fn purple(&self) -> &PurpleFlags {
        &self.purple
    }

    pub fn features(&self) -> &FeatureEngine {
        &self.features
    }

    /// Dense feature table for export
    pub fn feature_table(&self) -> FeatureTable {
        FeatureTable::build(&self.features, &self.grid)
    }

    pub fn stability_thresholds(&self) -> &StabilityThresholds {
        &self.stability
    }

    pub fn labels(&self) -> &[StabilityLabel] {
        &self.labels
    }

    /// Zone and purple diagnostics
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.zones
            .diagnostics()
            .iter()
            .chain(self.purple.diagnostics())
            .cloned()
            .collect()
    }

    /// Error of externally predicted stability scores on held-out labels
    pub fn evaluate_scores(&self, predicted: &ScoreTable) -> Option<HeldOutError> {
        let error = evaluate_held_out(&self.labels, predicted);
        if let Some(e) = &error {
            info!(
                "Held-out stability error over {} labels: MAE {:.3}, RMSE {:.3}",
                e.count, e.mae, e.rmse
            );
        }
        error
    }

    pub fn simulator(&self) -> Simulator<'_> {
        Simulator::new(
            &self.grid,
            &self.zones,
            &self.purple,
            &self.features,
            self.signal.as_ref(),
            SwitchingCostModel::from_config(&self.config),
        )
    }

    /// Run one spec; `cancel` aborts between ticks
    pub fn run(&self, spec: &RunSpec, cancel: Option<&AtomicBool>) -> Result<SimulationOutcome> {
        let ticks = spec.ticks.clone().unwrap_or_else(|| self.test_ticks());
        self.simulator()
            .run(spec.policy.as_ref(), &spec.initial_pool, ticks, cancel)
    }

    /// Run independent specs in parallel. Results are in spec order.
    pub fn run_many(&self, specs: &[RunSpec], cancel: Option<&AtomicBool>) -> Vec<Result<SimulationOutcome>> {
        info!("Running {} simulations", specs.len());
        specs.par_iter().map(|spec| self.run(spec, cancel)).collect()
    }
}

/// First held-out tick: `split_at` if set, otherwise `train_fraction` of the grid
fn split_tick(grid: &MarketGrid, config: &BacktestConfig) -> Result<usize> {
    let tick = match config.split_at {
        Some(at) => grid.tick_at_or_after(at),
        None => (grid.len() as f64 * config.train_fraction).floor() as usize,
    };

    if tick == 0 || tick >= grid.len() {
        return Err(BacktestError::config(format!(
            "train/test split at tick {} leaves an empty side (grid has {} ticks)",
            tick,
            grid.len()
        )));
    }
    Ok(tick)
}
