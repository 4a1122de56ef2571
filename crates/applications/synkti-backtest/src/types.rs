//! Core types for the backtest engine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a pool (`<family>.<size>@<zone>`)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PoolId(pub String);

impl PoolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the canonical id for an instance type in an availability zone
    pub fn from_parts(instance_type: &str, availability_zone: &str) -> Self {
        Self(format!("{}@{}", instance_type, availability_zone))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PoolId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A (resource type, location) pair with its own price history.
///
/// Static reference data, derived once from the distinct feed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    /// Hardware family (`m5` for `m5.large`)
    pub family: String,
    /// Size tier (`large` for `m5.large`), empty if the type has no size suffix
    pub size_tier: String,
    pub az: String,
}

impl Pool {
    pub fn new(instance_type: &str, availability_zone: &str) -> Self {
        let (family, size_tier) = match instance_type.split_once('.') {
            Some((family, size)) => (family.to_string(), size.to_string()),
            None => (instance_type.to_string(), String::new()),
        };

        Pool {
            id: PoolId::from_parts(instance_type, availability_zone),
            family,
            size_tier,
            az: availability_zone.to_string(),
        }
    }
}

/// Last-known prices for a pool at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub spot_price: f64,
    pub on_demand_price: f64,
}

impl PricePoint {
    /// Spot price as a fraction of on-demand, the price-position metric used
    /// for cross-pool comparison. Falls back to the raw spot price when the
    /// on-demand reference is zero.
    pub fn price_position(&self) -> f64 {
        if self.on_demand_price > 0.0 {
            self.spot_price / self.on_demand_price
        } else {
            self.spot_price
        }
    }

    /// Discount versus on-demand (1 - spot/on-demand)
    pub fn discount(&self) -> f64 {
        1.0 - self.price_position()
    }
}

/// Static risk band of a price against a pool's frozen thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Green,
    Yellow,
    Orange,
    Red,
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Zone::Green => write!(f, "green"),
            Zone::Yellow => write!(f, "yellow"),
            Zone::Orange => write!(f, "orange"),
            Zone::Red => write!(f, "red"),
        }
    }
}

/// Why the simulator considered leaving the current pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// Current pool is no longer in its green zone
    ZoneExit,
    /// Current pool carries a purple volatility flag
    PurpleZoneEnter,
    /// External risk signal flags the current pool
    AnomalyPredicted,
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerReason::ZoneExit => write!(f, "zone_exit"),
            TriggerReason::PurpleZoneEnter => write!(f, "purple_zone_enter"),
            TriggerReason::AnomalyPredicted => write!(f, "anomaly_predicted"),
        }
    }
}

/// A completed pool switch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwitchEvent {
    pub timestamp: DateTime<Utc>,
    pub from_pool: PoolId,
    pub to_pool: PoolId,
    pub trigger_reason: TriggerReason,
    pub cost: f64,
}
