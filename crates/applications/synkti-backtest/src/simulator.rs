//! Time-step simulator
//!
//! Replays the synchronized timeline one tick at a time while holding exactly
//! one pool:
//!
//! ```text
//!   tick t ──► snapshot(t) ──► policy.trigger ──► cheapest safe pool ──► switch?
//!                                   │                    │
//!                                   │ none               │ none ──► no-op attempt
//!                                   ▼                    ▼
//!                            accrue held pool's price for the tick
//! ```
//!
//! Every input is a precomputed table indexed by tick, so a run is a single
//! pass over the requested ticks. A run can be cancelled between ticks; the
//! switch log and costs up to the last completed tick are still returned.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cost::SwitchingCostModel;
use crate::error::{BacktestError, Result};
use crate::features::FeatureEngine;
use crate::policy::{MarketView, SwitchPolicy};
use crate::signals::RiskSignal;
use crate::sync::MarketGrid;
use crate::types::{PoolId, SwitchEvent, TriggerReason};
use crate::zones::{PurpleFlags, ZoneModel};

/// Mutable state of one run. Owned by the run, never shared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationState {
    pub current_pool_id: PoolId,
    pub entry_timestamp: DateTime<Utc>,
    /// Switching costs plus accrued holding costs so far
    pub cumulative_cost: f64,
    pub switch_log: Vec<SwitchEvent>,
}

/// Why a triggered switch did not happen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoSwitchReason {
    NoSafeAlternative,
}

/// A trigger that fired without a switch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoSwitchAttempt {
    pub timestamp: DateTime<Utc>,
    pub pool_id: PoolId,
    pub trigger_reason: TriggerReason,
    pub reason: NoSwitchReason,
}

/// Result of a simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutcome {
    pub policy_name: String,
    pub initial_pool: PoolId,
    pub final_pool: PoolId,
    pub switch_log: Vec<SwitchEvent>,
    pub no_switch_attempts: Vec<NoSwitchAttempt>,
    /// Spot price × hours of the pools actually held
    pub holding_cost: f64,
    /// Sum of switch costs
    pub switching_cost: f64,
    pub total_cost: f64,
    /// Holding the initial pool over the same ticks
    pub baseline_cost: f64,
    /// `(baseline - total) / baseline * 100`; `None` with a zero baseline
    pub savings_pct: Option<f64>,
    pub completed_ticks: usize,
    pub requested_ticks: usize,
    pub cancelled: bool,
}

impl SimulationOutcome {
    pub fn switch_count(&self) -> usize {
        self.switch_log.len()
    }
}

/// Sequential replay over precomputed market tables
pub struct Simulator<'a> {
    grid: &'a MarketGrid,
    zones: &'a ZoneModel,
    purple: &'a PurpleFlags,
    features: &'a FeatureEngine,
    signal: &'a dyn RiskSignal,
    cost_model: SwitchingCostModel,
}

impl<'a> Simulator<'a> {
    pub fn new(
        grid: &'a MarketGrid,
        zones: &'a ZoneModel,
        purple: &'a PurpleFlags,
        features: &'a FeatureEngine,
        signal: &'a dyn RiskSignal,
        cost_model: SwitchingCostModel,
    ) -> Self {
        Simulator {
            grid,
            zones,
            purple,
            features,
            signal,
            cost_model,
        }
    }

    fn view(&self, tick: usize) -> MarketView<'a> {
        MarketView {
            snapshot: self.grid.snapshot(tick),
            zones: self.zones,
            purple: self.purple,
            features: self.features,
            signal: self.signal,
        }
    }

    /// Run `policy` from `initial_pool` over `ticks`.
    ///
    /// The initial pool must be on the grid and have zone thresholds.
    /// `cancel` is polled before every tick.
    pub fn run(
        &self,
        policy: &dyn SwitchPolicy,
        initial_pool: &PoolId,
        ticks: Range<usize>,
        cancel: Option<&AtomicBool>,
    ) -> Result<SimulationOutcome> {
        let initial = self.grid.require_pool(initial_pool)?;
        if self.zones.thresholds(initial).is_none() {
            return Err(BacktestError::config(format!(
                "initial pool {} has no training data",
                initial_pool
            )));
        }

        let ticks = ticks.start.min(self.grid.len())..ticks.end.min(self.grid.len());
        let requested_ticks = ticks.len();
        let tick_hours = self.grid.tick_hours();

        info!(
            "Running {} from {} over {} ticks",
            policy.name(),
            initial_pool,
            requested_ticks
        );

        let mut current = initial;
        let mut state = SimulationState {
            current_pool_id: initial_pool.clone(),
            entry_timestamp: self
                .grid
                .timestamps()
                .get(ticks.start)
                .copied()
                .unwrap_or_default(),
            cumulative_cost: 0.0,
            switch_log: Vec::new(),
        };
        let mut no_switch_attempts = Vec::new();
        let mut holding_cost = 0.0;
        let mut switching_cost = 0.0;
        let mut baseline_cost = 0.0;
        let mut completed_ticks = 0;
        let mut cancelled = false;

        for tick in ticks {
            if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
                warn!(
                    "{} from {} cancelled after {} ticks",
                    policy.name(),
                    initial_pool,
                    completed_ticks
                );
                cancelled = true;
                break;
            }

            let view = self.view(tick);
            let timestamp = view.snapshot.timestamp();

            // A pool without a price yet is held without evaluating triggers
            if let Some(held) = view.snapshot.get(current) {
                if let Some(trigger) = policy.trigger(&view, current) {
                    match view.cheapest_safe(current) {
                        Some(target) => {
                            let to = view.snapshot.pool(target);
                            let to_price = view.snapshot.get(target).map_or(0.0, |p| p.spot_price);
                            let cost = self.cost_model.switch_cost(held.spot_price, to_price);

                            debug!(
                                "{}: {} -> {} ({}), cost {:.4}",
                                timestamp, state.current_pool_id, to.id, trigger, cost
                            );
                            state.switch_log.push(SwitchEvent {
                                timestamp,
                                from_pool: state.current_pool_id.clone(),
                                to_pool: to.id.clone(),
                                trigger_reason: trigger,
                                cost,
                            });
                            state.current_pool_id = to.id.clone();
                            state.entry_timestamp = timestamp;
                            state.cumulative_cost += cost;
                            switching_cost += cost;
                            current = target;
                        }
                        None => {
                            debug!(
                                "{}: {} triggered ({}) but no safe alternative",
                                timestamp, state.current_pool_id, trigger
                            );
                            no_switch_attempts.push(NoSwitchAttempt {
                                timestamp,
                                pool_id: state.current_pool_id.clone(),
                                trigger_reason: trigger,
                                reason: NoSwitchReason::NoSafeAlternative,
                            });
                        }
                    }
                }
            }

            let held_cost = view.snapshot.get(current).map_or(0.0, |p| p.spot_price) * tick_hours;
            holding_cost += held_cost;
            state.cumulative_cost += held_cost;
            baseline_cost += view.snapshot.get(initial).map_or(0.0, |p| p.spot_price) * tick_hours;
            completed_ticks += 1;
        }

        let total_cost = holding_cost + switching_cost;
        let savings_pct =
            (baseline_cost > 0.0).then(|| (baseline_cost - total_cost) / baseline_cost * 100.0);

        info!(
            "{} from {}: {} switches, {} no-op attempts, total ${:.4} vs baseline ${:.4}",
            policy.name(),
            initial_pool,
            state.switch_log.len(),
            no_switch_attempts.len(),
            total_cost,
            baseline_cost
        );

        Ok(SimulationOutcome {
            policy_name: policy.name().to_string(),
            initial_pool: initial_pool.clone(),
            final_pool: state.current_pool_id,
            switch_log: state.switch_log,
            no_switch_attempts,
            holding_cost,
            switching_cost,
            total_cost,
            baseline_cost,
            savings_pct,
            completed_ticks,
            requested_ticks,
            cancelled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{Feed, FeedRecord};
    use crate::policy::{NeverSwitchPolicy, ZoneHeuristicPolicy};
    use crate::signals::{NoRiskSignal, RiskFact, RiskPredictions, ScoreTable, SharedRiskFacts};
    use crate::types::Zone;
    use crate::zones::TrainWindow;
    use chrono::{TimeDelta, TimeZone};

    struct Fixture {
        grid: MarketGrid,
        zones: ZoneModel,
        purple: PurpleFlags,
        features: FeatureEngine,
    }

    impl Fixture {
        /// Hourly series per `instance_type@az`, training on the first `train` ticks
        fn new(series: &[(&str, &str, Vec<f64>)], train: usize) -> Self {
            Self::starting_at(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(), series, train)
        }

        fn starting_at(start: DateTime<Utc>, series: &[(&str, &str, Vec<f64>)], train: usize) -> Self {
            let feed = Feed::from_records(series.iter().flat_map(|(ty, az, prices)| {
                prices.iter().enumerate().map(move |(i, p)| {
                    FeedRecord::new(start + TimeDelta::hours(i as i64), *ty, *az, *p, 1.0)
                })
            }))
            .unwrap();
            let grid = MarketGrid::synchronize(&feed, TimeDelta::hours(1)).unwrap();
            let zones = ZoneModel::fit(&grid, TrainWindow { start: 0, end: train });
            let purple = PurpleFlags::compute(&grid, 2, 2.0);
            let features = FeatureEngine::new(&grid);
            Fixture {
                grid,
                zones,
                purple,
                features,
            }
        }

        fn simulator<'a>(&'a self, signal: &'a dyn RiskSignal) -> Simulator<'a> {
            Simulator::new(
                &self.grid,
                &self.zones,
                &self.purple,
                &self.features,
                signal,
                SwitchingCostModel::new(0.01, 5.0),
            )
        }
    }

    #[test]
    fn test_zone_exit_switches_to_cheapest_green() {
        let fx = Fixture::new(
            &[
                ("m5.large", "us-east-1a", vec![0.10, 0.10, 0.10, 0.30, 0.30]),
                ("m5.large", "us-east-1b", vec![0.12; 5]),
                ("c5.large", "us-east-1a", vec![0.20; 5]),
            ],
            3,
        );
        let sim = fx.simulator(&NoRiskSignal);
        let out = sim
            .run(&ZoneHeuristicPolicy::new(), &PoolId::from("m5.large@us-east-1a"), 3..5, None)
            .unwrap();

        assert_eq!(out.switch_count(), 1);
        let event = &out.switch_log[0];
        assert_eq!(event.to_pool, PoolId::from("m5.large@us-east-1b"));
        assert_eq!(event.trigger_reason, TriggerReason::ZoneExit);
        assert!((event.cost - (0.01 + 0.42 * 5.0 / 60.0)).abs() < 1e-12);
        assert_eq!(out.final_pool, PoolId::from("m5.large@us-east-1b"));

        // Held B for both ticks after the first decision
        assert!((out.holding_cost - 0.24).abs() < 1e-12);
        assert!((out.baseline_cost - 0.60).abs() < 1e-12);
        assert!(out.savings_pct.unwrap() > 0.0);
    }

    #[test]
    fn test_never_switch_matches_baseline() {
        let fx = Fixture::new(
            &[
                ("m5.large", "us-east-1a", vec![0.10, 0.10, 0.10, 0.30, 0.30]),
                ("m5.large", "us-east-1b", vec![0.12; 5]),
            ],
            3,
        );
        let out = fx
            .simulator(&NoRiskSignal)
            .run(&NeverSwitchPolicy, &PoolId::from("m5.large@us-east-1a"), 3..5, None)
            .unwrap();

        assert!(out.switch_log.is_empty());
        assert_eq!(out.total_cost, out.baseline_cost);
        assert_eq!(out.savings_pct, Some(0.0));
    }

    #[test]
    fn test_no_safe_alternative_is_logged() {
        let fx = Fixture::new(
            &[
                ("m5.large", "us-east-1a", vec![0.10, 0.10, 0.10, 0.30]),
                ("m5.large", "us-east-1b", vec![0.12, 0.12, 0.12, 0.50]),
            ],
            3,
        );
        let out = fx
            .simulator(&NoRiskSignal)
            .run(&ZoneHeuristicPolicy::new(), &PoolId::from("m5.large@us-east-1a"), 3..4, None)
            .unwrap();

        assert!(out.switch_log.is_empty());
        assert_eq!(out.no_switch_attempts.len(), 1);
        assert_eq!(out.no_switch_attempts[0].reason, NoSwitchReason::NoSafeAlternative);
        assert_eq!(out.final_pool, PoolId::from("m5.large@us-east-1a"));
    }

    #[test]
    fn test_anomaly_trigger_and_flagged_targets_excluded() {
        let fx = Fixture::new(
            &[
                ("m5.large", "us-east-1a", vec![0.10; 4]),
                ("m5.large", "us-east-1b", vec![0.12; 4]),
                ("m5.large", "us-east-1c", vec![0.15; 4]),
            ],
            3,
        );
        let at = fx.grid.timestamp(3);
        let mut table = ScoreTable::default();
        table.insert(PoolId::from("m5.large@us-east-1a"), at, 0.9);
        table.insert(PoolId::from("m5.large@us-east-1b"), at, 0.7);
        let signal = RiskPredictions::new(table, 0.5);

        let out = fx
            .simulator(&signal)
            .run(&ZoneHeuristicPolicy::new(), &PoolId::from("m5.large@us-east-1a"), 3..4, None)
            .unwrap();

        assert_eq!(out.switch_count(), 1);
        assert_eq!(out.switch_log[0].trigger_reason, TriggerReason::AnomalyPredicted);
        assert_eq!(out.switch_log[0].to_pool, PoolId::from("m5.large@us-east-1c"));

        let ignore_anomaly = ZoneHeuristicPolicy::new().with_anomaly(false);
        let out = fx
            .simulator(&signal)
            .run(&ignore_anomaly, &PoolId::from("m5.large@us-east-1a"), 3..4, None)
            .unwrap();
        assert!(out.switch_log.is_empty());
    }

    #[test]
    fn test_purple_trigger_skips_purple_targets() {
        // Q1 is the 24 hours of Mar 31; Q2 starts at tick 24
        let start = Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap();
        let oscillate = |lo: f64, hi: f64, spike: f64| -> Vec<f64> {
            (0..31)
                .map(|i| if i == 30 { spike } else if i % 2 == 0 { lo } else { hi })
                .collect()
        };
        let fx = Fixture::starting_at(
            start,
            &[
                ("m5.large", "us-east-1a", oscillate(0.10, 0.11, 0.02)),
                ("m5.large", "us-east-1b", oscillate(0.12, 0.13, 0.03)),
                ("m5.large", "us-east-1c", vec![0.15; 31]),
            ],
            24,
        );
        let (a, b, c) = (0, 1, 2);

        assert!(fx.purple.is_flagged(a, 30));
        assert!(fx.purple.is_flagged(b, 30));
        assert!(!fx.purple.is_flagged(c, 30));
        assert!((24..30).all(|tick| !fx.purple.is_flagged(a, tick)));
        assert_eq!(fx.zones.zone(a, 0.02), Some(Zone::Green));

        let out = fx
            .simulator(&NoRiskSignal)
            .run(&ZoneHeuristicPolicy::new(), &PoolId::from("m5.large@us-east-1a"), 24..31, None)
            .unwrap();

        assert_eq!(out.switch_count(), 1);
        let event = &out.switch_log[0];
        assert_eq!(event.timestamp, fx.grid.timestamp(30));
        assert_eq!(event.trigger_reason, TriggerReason::PurpleZoneEnter);
        // The cheaper pool is purple too, so the calm one wins
        assert_eq!(event.to_pool, PoolId::from("m5.large@us-east-1c"));

        let out = fx
            .simulator(&NoRiskSignal)
            .run(
                &ZoneHeuristicPolicy::new().with_purple(false),
                &PoolId::from("m5.large@us-east-1a"),
                24..31,
                None,
            )
            .unwrap();
        assert!(out.switch_log.is_empty());
    }

    #[test]
    fn test_shared_risk_fact_triggers_until_expiry() {
        let fx = Fixture::new(
            &[
                ("m5.large", "us-east-1a", vec![0.10; 6]),
                ("m5.large", "us-east-1b", vec![0.12; 6]),
                ("m5.large", "us-east-1c", vec![0.15; 6]),
            ],
            3,
        );
        let at = fx.grid.timestamp(3);
        let facts = SharedRiskFacts::new([
            RiskFact::new(PoolId::from("m5.large@us-east-1a"), at, TimeDelta::minutes(30)).unwrap(),
            // Expired an hour before tick 3
            RiskFact::new(PoolId::from("m5.large@us-east-1b"), at - TimeDelta::hours(2), TimeDelta::hours(1))
                .unwrap(),
        ]);
        let sim = fx.simulator(&facts);
        let policy = ZoneHeuristicPolicy::new();
        let id = PoolId::from("m5.large@us-east-1a");

        let out = sim.run(&policy, &id, 3..6, None).unwrap();
        assert_eq!(out.switch_count(), 1);
        assert_eq!(out.switch_log[0].timestamp, at);
        assert_eq!(out.switch_log[0].trigger_reason, TriggerReason::AnomalyPredicted);
        assert_eq!(out.switch_log[0].to_pool, PoolId::from("m5.large@us-east-1b"));

        // By tick 4 the fact on A has expired
        let out = sim.run(&policy, &id, 4..6, None).unwrap();
        assert!(out.switch_log.is_empty());
        assert!(out.no_switch_attempts.is_empty());
    }

    #[test]
    fn test_price_tie_broken_by_family_stress() {
        let fx = Fixture::new(
            &[
                ("m5.large", "us-east-1a", vec![0.10, 0.10, 0.10, 0.30]),
                ("c5.large", "us-east-1a", vec![0.12; 4]),
                ("c5.xlarge", "us-east-1a", vec![0.90; 4]),
                ("r5.large", "us-east-1a", vec![0.12; 4]),
            ],
            3,
        );
        let out = fx
            .simulator(&NoRiskSignal)
            .run(&ZoneHeuristicPolicy::new(), &PoolId::from("m5.large@us-east-1a"), 3..4, None)
            .unwrap();

        assert_eq!(out.switch_log[0].to_pool, PoolId::from("r5.large@us-east-1a"));
    }

    #[test]
    fn test_price_tie_broken_by_pool_id() {
        let fx = Fixture::new(
            &[
                ("m5.large", "us-east-1a", vec![0.10, 0.10, 0.10, 0.30]),
                ("c5.large", "us-east-1b", vec![0.12; 4]),
                ("c5.large", "us-east-1a", vec![0.12; 4]),
            ],
            3,
        );
        let out = fx
            .simulator(&NoRiskSignal)
            .run(&ZoneHeuristicPolicy::new(), &PoolId::from("m5.large@us-east-1a"), 3..4, None)
            .unwrap();

        assert_eq!(out.switch_log[0].to_pool, PoolId::from("c5.large@us-east-1a"));
    }

    #[test]
    fn test_cancelled_run_returns_partial_outcome() {
        let fx = Fixture::new(&[("m5.large", "us-east-1a", vec![0.10; 6])], 3);
        let cancel = AtomicBool::new(true);
        let out = fx
            .simulator(&NoRiskSignal)
            .run(
                &ZoneHeuristicPolicy::new(),
                &PoolId::from("m5.large@us-east-1a"),
                3..6,
                Some(&cancel),
            )
            .unwrap();

        assert!(out.cancelled);
        assert_eq!(out.completed_ticks, 0);
        assert_eq!(out.requested_ticks, 3);
        assert_eq!(out.total_cost, 0.0);
    }

    #[test]
    fn test_unknown_initial_pool() {
        let fx = Fixture::new(&[("m5.large", "us-east-1a", vec![0.10; 4])], 3);
        let err = fx
            .simulator(&NoRiskSignal)
            .run(&NeverSwitchPolicy, &PoolId::from("x1.large@nowhere"), 3..4, None)
            .unwrap_err();

        assert!(matches!(err, BacktestError::UnknownPool(_)));
    }

    #[test]
    fn test_runs_are_deterministic() {
        let fx = Fixture::new(
            &[
                ("m5.large", "us-east-1a", vec![0.10, 0.11, 0.10, 0.30, 0.10, 0.40, 0.10]),
                ("m5.large", "us-east-1b", vec![0.12, 0.13, 0.12, 0.12, 0.50, 0.12, 0.12]),
                ("c5.large", "us-east-1a", vec![0.20, 0.21, 0.20, 0.20, 0.20, 0.20, 0.90]),
            ],
            3,
        );
        let sim = fx.simulator(&NoRiskSignal);
        let policy = ZoneHeuristicPolicy::new();
        let id = PoolId::from("m5.large@us-east-1a");

        let a = sim.run(&policy, &id, 3..7, None).unwrap();
        let b = sim.run(&policy, &id, 3..7, None).unwrap();
        assert_eq!(a, b);
    }
}
