//! Error types for the backtest engine

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Backtest result type
pub type Result<T> = std::result::Result<T, BacktestError>;

/// Errors that abort a backtest.
///
/// Degenerate market data (flat prices, collapsed thresholds) and missing safe
/// alternatives are not errors; they surface as [`crate::zones::Diagnostic`]
/// and [`crate::simulator::NoSwitchAttempt`] values instead.
#[derive(Error, Debug)]
pub enum BacktestError {
    /// Feed header is missing a required column
    #[error("Feed is missing required column '{column}'")]
    MissingColumn { column: String },

    /// Per-pool timestamps went backwards
    #[error("Non-monotonic timestamps for pool {pool}: {current} follows {previous}")]
    NonMonotonicTimestamps {
        pool: String,
        previous: DateTime<Utc>,
        current: DateTime<Utc>,
    },

    /// Negative spot or on-demand price
    #[error("Negative {field} for pool {pool}: {value}")]
    NegativePrice {
        pool: String,
        field: &'static str,
        value: f64,
    },

    /// NaN or infinite spot or on-demand price
    #[error("Non-finite {field} for pool {pool}: {value}")]
    NonFinitePrice {
        pool: String,
        field: &'static str,
        value: f64,
    },

    /// Malformed record (bad timestamp, unparseable instance type)
    #[error("Invalid record at line {line}: {reason}")]
    InvalidRecord { line: u64, reason: String },

    /// Feed has no usable records
    #[error("Feed contains no records")]
    EmptyFeed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pool not present in the synchronized grid
    #[error("Pool {0} not found")]
    UnknownPool(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BacktestError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-record error
    pub fn invalid_record(line: u64, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            line,
            reason: reason.into(),
        }
    }

    /// Create a missing-column error
    pub fn missing_column(column: impl Into<String>) -> Self {
        Self::MissingColumn {
            column: column.into(),
        }
    }
}
