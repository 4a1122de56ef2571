//! External risk signals
//!
//! Risk originates outside the engine: an anomaly model scoring pools, or
//! other clients reporting that a pool is currently risky. Both are read-only
//! facts queried by `(pool, timestamp)`; the simulator never owns or mutates
//! them.
//!
//! Predictions are visible only at exactly the tick they are stamped with, so
//! a prediction made for a later tick cannot influence an earlier decision.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{BacktestError, Result};
use crate::feed::parse_timestamp;
use crate::types::PoolId;

/// Source of per-pool, per-instant risk flags
pub trait RiskSignal: Send + Sync {
    /// Is `pool` considered high-risk at `at`?
    fn is_flagged(&self, pool: &PoolId, at: DateTime<Utc>) -> bool;

    /// Signal name for logs
    fn name(&self) -> &str;
}

/// Never flags anything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRiskSignal;

impl RiskSignal for NoRiskSignal {
    fn is_flagged(&self, _pool: &PoolId, _at: DateTime<Utc>) -> bool {
        false
    }

    fn name(&self) -> &str {
        "none"
    }
}

#[derive(Debug, Deserialize)]
struct ScoreRecord {
    pool_id: String,
    timestamp: String,
    score: f64,
}

/// Scalar per (pool, timestamp), loaded from `pool_id,timestamp,score` CSV
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreTable {
    scores: BTreeMap<(PoolId, DateTime<Utc>), f64>,
}

impl ScoreTable {
    pub fn insert(&mut self, pool: PoolId, at: DateTime<Utc>, score: f64) {
        self.scores.insert((pool, at), score);
    }

    pub fn get(&self, pool: &PoolId, at: DateTime<Utc>) -> Option<f64> {
        self.scores.get(&(pool.clone(), at)).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv = csv::Reader::from_reader(reader);
        let mut table = ScoreTable::default();

        for (i, record) in csv.deserialize::<ScoreRecord>().enumerate() {
            let line = i as u64 + 2;
            let record = record.map_err(|e| BacktestError::invalid_record(line, e.to_string()))?;
            let at = parse_timestamp(&record.timestamp).ok_or_else(|| {
                BacktestError::invalid_record(line, format!("invalid timestamp '{}'", record.timestamp))
            })?;
            if !record.score.is_finite() {
                return Err(BacktestError::invalid_record(line, "score must be finite"));
            }
            table.insert(PoolId::new(record.pool_id), at, record.score);
        }

        Ok(table)
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_csv_reader(file)
    }
}

/// External anomaly predictions thresholded into flags
#[derive(Debug, Clone)]
pub struct RiskPredictions {
    table: ScoreTable,
    decision_threshold: f64,
}

impl RiskPredictions {
    pub fn new(table: ScoreTable, decision_threshold: f64) -> Self {
        info!(
            "Loaded {} risk predictions (decision threshold {})",
            table.len(),
            decision_threshold
        );
        RiskPredictions {
            table,
            decision_threshold,
        }
    }

    pub fn score(&self, pool: &PoolId, at: DateTime<Utc>) -> Option<f64> {
        self.table.get(pool, at)
    }
}

impl RiskSignal for RiskPredictions {
    fn is_flagged(&self, pool: &PoolId, at: DateTime<Utc>) -> bool {
        self.score(pool, at)
            .is_some_and(|score| score >= self.decision_threshold)
    }

    fn name(&self) -> &str {
        "predictions"
    }
}

/// A report that a pool is risky for a bounded time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskFact {
    pub pool_id: PoolId,
    pub reported_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RiskFact {
    /// Fact active for `ttl` from `reported_at`; the ttl must be positive
    pub fn new(pool_id: PoolId, reported_at: DateTime<Utc>, ttl: TimeDelta) -> Result<Self> {
        let expires_at = expiry(reported_at, ttl).map_err(BacktestError::config)?;
        Ok(RiskFact {
            pool_id,
            reported_at,
            expires_at,
        })
    }

    /// Active over `[reported_at, expires_at)`
    pub fn is_active(&self, at: DateTime<Utc>) -> bool {
        at >= self.reported_at && at < self.expires_at
    }

    pub fn ttl(&self) -> TimeDelta {
        self.expires_at - self.reported_at
    }
}

fn expiry(reported_at: DateTime<Utc>, ttl: TimeDelta) -> std::result::Result<DateTime<Utc>, String> {
    if ttl <= TimeDelta::zero() {
        return Err(format!("risk fact ttl must be positive, got {}", ttl));
    }
    reported_at
        .checked_add_signed(ttl)
        .ok_or_else(|| format!("risk fact ttl {} overflows from {}", ttl, reported_at))
}

#[derive(Debug, Deserialize)]
struct RiskFactRecord {
    pool_id: String,
    reported_at: String,
    ttl_minutes: i64,
}

/// Shared, TTL-bounded risk facts reported by other clients
#[derive(Debug, Clone, Default)]
pub struct SharedRiskFacts {
    by_pool: BTreeMap<PoolId, Vec<RiskFact>>,
}

impl SharedRiskFacts {
    pub fn new(facts: impl IntoIterator<Item = RiskFact>) -> Self {
        let mut shared = SharedRiskFacts::default();
        for fact in facts {
            shared.report(fact);
        }
        shared
    }

    pub fn report(&mut self, fact: RiskFact) {
        self.by_pool.entry(fact.pool_id.clone()).or_default().push(fact);
    }

    /// Load `pool_id,reported_at,ttl_minutes` rows
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv = csv::Reader::from_reader(reader);
        let mut facts = Vec::new();
        for (i, record) in csv.deserialize::<RiskFactRecord>().enumerate() {
            let line = i as u64 + 2;
            let record = record.map_err(|e| BacktestError::invalid_record(line, e.to_string()))?;
            let reported_at = parse_timestamp(&record.reported_at).ok_or_else(|| {
                BacktestError::invalid_record(line, format!("invalid timestamp '{}'", record.reported_at))
            })?;
            let ttl = TimeDelta::try_minutes(record.ttl_minutes).ok_or_else(|| {
                BacktestError::invalid_record(line, format!("ttl_minutes {} out of range", record.ttl_minutes))
            })?;
            let expires_at = expiry(reported_at, ttl).map_err(|e| BacktestError::invalid_record(line, e))?;
            facts.push(RiskFact {
                pool_id: PoolId::new(record.pool_id),
                reported_at,
                expires_at,
            });
        }
        info!("Loaded {} shared risk facts", facts.len());
        Ok(Self::new(facts))
    }
}

impl RiskSignal for SharedRiskFacts {
    fn is_flagged(&self, pool: &PoolId, at: DateTime<Utc>) -> bool {
        self.by_pool
            .get(pool)
            .is_some_and(|facts| facts.iter().any(|f| f.is_active(at)))
    }

    fn name(&self) -> &str {
        "shared_risk"
    }
}

/// Flags a pool when any inner signal does
#[derive(Default)]
pub struct AnySignal {
    signals: Vec<Box<dyn RiskSignal>>,
}

impl AnySignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, signal: impl RiskSignal + 'static) -> Self {
        self.signals.push(Box::new(signal));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}

impl RiskSignal for AnySignal {
    fn is_flagged(&self, pool: &PoolId, at: DateTime<Utc>) -> bool {
        self.signals.iter().any(|s| s.is_flagged(pool, at))
    }

    fn name(&self) -> &str {
        "any"
    }
}
