//! # Synkti Backtest
//!
//! Leakage-free replay of spot pool switching policies.
//!
//! ## Architecture
//!
//! ```text
//! price feed ──► Synchronizer ──► MarketGrid ──┬─► Zone thresholds / purple flags
//!                                              ├─► Hierarchical features
//!                                              └─► Stability labels (offline only)
//!                                                        │
//!                    risk signal ──► Simulator ◄─────────┘
//!                                       │
//!                                       ▼
//!                          switch log + cost ledger + summary
//! ```
//!
//! Every decision at tick `t` reads only data observable at `t`:
//! - prices are forward-filled onto the grid, never back-filled
//! - zone thresholds come from the training window and are frozen
//! - purple baselines come from the preceding quarter
//! - risk predictions are visible only at the tick they are stamped with
//!
//! Only the simulator carries state across ticks. Everything else is computed
//! once per backtest and shared read-only between runs.

#![warn(clippy::all)]

pub mod backtest;
pub mod config;
pub mod cost;
pub mod error;
pub mod features;
pub mod feed;
pub mod policy;
pub mod report;
pub mod signals;
pub mod simulator;
pub mod spot_data;
pub mod stability;
pub mod stats;
pub mod sync;
pub mod types;
pub mod zones;

// ============================================================================
// Public exports
// ============================================================================

// Pipeline
pub use backtest::{Backtest, RunSpec};
pub use config::{BacktestConfig, InstabilityThreshold};
pub use error::{BacktestError, Result};

// Market data
pub use feed::{Feed, FeedRecord};
pub use sync::{MarketGrid, MarketSnapshot};
pub use types::{Pool, PoolId, PricePoint, SwitchEvent, TriggerReason, Zone};

// Derived tables
pub use features::{FeatureEngine, FeatureRow, FeatureTable, HierarchicalFeatureRow};
pub use stability::{HeldOutError, StabilityLabel, StabilityScorer};
pub use zones::{Diagnostic, PurpleFlags, TrainWindow, ZoneModel, ZoneThresholds};

// Simulation
pub use cost::SwitchingCostModel;
pub use policy::{NeverSwitchPolicy, SwitchPolicy, ZoneHeuristicPolicy};
pub use signals::{AnySignal, NoRiskSignal, RiskPredictions, RiskSignal, ScoreTable, SharedRiskFacts};
pub use simulator::{NoSwitchAttempt, SimulationOutcome, Simulator};

// Synthetic data
pub use spot_data::{SyntheticFeed, SyntheticPool};
