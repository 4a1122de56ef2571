//! Switching cost model
//!
//! Moving a workload between pools pays a flat API cost plus the overlap
//! window during which both instances run:
//!
//! ```text
//! cost = api_cost + (price_from + price_to) * overlap_minutes / 60
//! ```
//!
//! Both prices are spot prices at the decision tick.

use serde::{Deserialize, Serialize};

use crate::config::BacktestConfig;

/// Cost of one pool switch
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwitchingCostModel {
    /// Flat cost per switch ($)
    pub api_cost: f64,
    /// Minutes both instances run during the handover
    pub overlap_minutes: f64,
}

impl Default for SwitchingCostModel {
    fn default() -> Self {
        Self::from_config(&BacktestConfig::default())
    }
}

impl SwitchingCostModel {
    pub fn new(api_cost: f64, overlap_minutes: f64) -> Self {
        SwitchingCostModel {
            api_cost,
            overlap_minutes,
        }
    }

    pub fn from_config(config: &BacktestConfig) -> Self {
        Self::new(config.switching_api_cost, config.overlap_minutes)
    }

    /// Cost of switching between two pools at their current spot prices
    pub fn switch_cost(&self, price_from: f64, price_to: f64) -> f64 {
        self.api_cost + (price_from + price_to) * self.overlap_minutes / 60.0
    }

    /// Cost of the overlap alone, for reporting
    pub fn overlap_cost(&self, price_from: f64, price_to: f64) -> f64 {
        self.switch_cost(price_from, price_to) - self.api_cost
    }
}
