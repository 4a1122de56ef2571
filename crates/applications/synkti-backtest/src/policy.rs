//! Switching policies
//!
//! A policy decides *whether* the current pool should be left at a tick.
//! *Where* to go is fixed: the cheapest safe pool in the same snapshot, with
//! ties broken by lower family stress and then by pool id. Keeping target
//! selection outside the policy means every policy is compared on the same
//! market view.
//!
//! Policies to compare:
//! - ZoneHeuristic: leave on zone exit, purple flag or external risk flag
//! - NeverSwitch: hold the starting pool (cost baseline)

use tracing::trace;

use crate::features::FeatureEngine;
use crate::signals::RiskSignal;
use crate::sync::MarketSnapshot;
use crate::types::{TriggerReason, Zone};
use crate::zones::{PurpleFlags, ZoneModel};

/// Everything observable at one tick. Built from precomputed, read-only tables.
#[derive(Clone, Copy)]
pub struct MarketView<'a> {
    pub snapshot: MarketSnapshot<'a>,
    pub zones: &'a ZoneModel,
    pub purple: &'a PurpleFlags,
    pub features: &'a FeatureEngine,
    pub signal: &'a dyn RiskSignal,
}

impl<'a> MarketView<'a> {
    /// Zone of a pool at this tick; `None` without a price or thresholds
    pub fn zone(&self, pool: usize) -> Option<Zone> {
        let price = self.snapshot.get(pool)?;
        self.zones.zone(pool, price.spot_price)
    }

    pub fn is_purple(&self, pool: usize) -> bool {
        self.purple.is_flagged(pool, self.snapshot.tick())
    }

    pub fn is_risk_flagged(&self, pool: usize) -> bool {
        self.signal
            .is_flagged(&self.snapshot.pool(pool).id, self.snapshot.timestamp())
    }

    /// Green, not purple and not risk-flagged
    pub fn is_safe(&self, pool: usize) -> bool {
        self.zone(pool) == Some(Zone::Green) && !self.is_purple(pool) && !self.is_risk_flagged(pool)
    }

    /// Cheapest safe pool other than `current`.
    ///
    /// Ties on spot price go to the lower family stress (missing stress sorts
    /// last), then to the lower pool id.
    pub fn cheapest_safe(&self, current: usize) -> Option<usize> {
        let candidates: Vec<(usize, f64)> = self
            .snapshot
            .iter()
            .filter(|(pool, _, _)| *pool != current && self.is_safe(*pool))
            .map(|(pool, _, point)| (pool, point.spot_price))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let stress = self.features.family_stress(self.snapshot);
        let stress_of = |pool: usize| {
            let s = stress[self.features.family_of(pool)];
            if s.is_nan() { f64::INFINITY } else { s }
        };

        candidates
            .into_iter()
            .min_by(|(a, pa), (b, pb)| {
                pa.total_cmp(pb)
                    .then_with(|| stress_of(*a).total_cmp(&stress_of(*b)))
                    .then_with(|| a.cmp(b))
            })
            .map(|(pool, _)| pool)
    }
}

/// Switching policy trait
pub trait SwitchPolicy: Send + Sync {
    /// Reason to leave `current` at this tick, if any
    fn trigger(&self, view: &MarketView<'_>, current: usize) -> Option<TriggerReason>;

    /// Get policy name
    fn name(&self) -> &str;
}

/// Leaves the current pool when it exits green, turns purple or is flagged
/// by the risk signal. Triggers are checked in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneHeuristicPolicy {
    pub zone_exit: bool,
    pub purple: bool,
    pub anomaly: bool,
}

impl Default for ZoneHeuristicPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ZoneHeuristicPolicy {
    /// All triggers enabled
    pub fn new() -> Self {
        ZoneHeuristicPolicy {
            zone_exit: true,
            purple: true,
            anomaly: true,
        }
    }

    pub fn with_zone_exit(mut self, enabled: bool) -> Self {
        self.zone_exit = enabled;
        self
    }

    pub fn with_purple(mut self, enabled: bool) -> Self {
        self.purple = enabled;
        self
    }

    pub fn with_anomaly(mut self, enabled: bool) -> Self {
        self.anomaly = enabled;
        self
    }
}

impl SwitchPolicy for ZoneHeuristicPolicy {
    fn trigger(&self, view: &MarketView<'_>, current: usize) -> Option<TriggerReason> {
        let zone = view.zone(current);
        trace!("tick {}: pool {} in zone {:?}", view.snapshot.tick(), current, zone);

        if self.zone_exit && matches!(zone, Some(z) if z != Zone::Green) {
            return Some(TriggerReason::ZoneExit);
        }
        if self.purple && view.is_purple(current) {
            return Some(TriggerReason::PurpleZoneEnter);
        }
        if self.anomaly && view.is_risk_flagged(current) {
            return Some(TriggerReason::AnomalyPredicted);
        }
        None
    }

    fn name(&self) -> &str {
        "ZoneHeuristic"
    }
}

/// Baseline policy: hold the starting pool for the whole run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NeverSwitchPolicy;

impl SwitchPolicy for NeverSwitchPolicy {
    fn trigger(&self, _view: &MarketView<'_>, _current: usize) -> Option<TriggerReason> {
        None
    }

    fn name(&self) -> &str {
        "NeverSwitch"
    }
}
