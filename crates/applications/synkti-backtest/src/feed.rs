//! Raw per-pool price feed
//!
//! The acquisition side (scraping, column-name inference) lives outside this
//! crate. By the time records reach [`Feed`] the five required fields are
//! resolved; anything else is an input error that aborts with pool or column
//! context.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info};

use crate::error::{BacktestError, Result};
use crate::types::{Pool, PoolId, PricePoint};

/// Columns the engine requires, in canonical order
pub const REQUIRED_COLUMNS: [&str; 5] = [
    "timestamp",
    "instance_type",
    "availability_zone",
    "spot_price",
    "on_demand_price",
];

/// One observation from the external feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedRecord {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub instance_type: String,
    pub availability_zone: String,
    pub spot_price: f64,
    pub on_demand_price: f64,
}

impl FeedRecord {
    pub fn new(
        timestamp: DateTime<Utc>,
        instance_type: impl Into<String>,
        availability_zone: impl Into<String>,
        spot_price: f64,
        on_demand_price: f64,
    ) -> Self {
        FeedRecord {
            timestamp,
            instance_type: instance_type.into(),
            availability_zone: availability_zone.into(),
            spot_price,
            on_demand_price,
        }
    }
}

/// Parse an ISO-8601 timestamp. Offsets are honoured; naive values are UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid ISO-8601 timestamp '{}'", raw)))
}

/// Validated feed, grouped by pool.
///
/// Pools are held in lexicographic id order; every per-pool series is sorted
/// by timestamp with duplicate timestamps collapsed (later record wins).
#[derive(Debug, Clone)]
pub struct Feed {
    pools: Vec<Pool>,
    series: Vec<Vec<PricePoint>>,
}

impl Feed {
    /// Build a feed from in-memory records.
    ///
    /// Per-pool timestamps must be non-decreasing in input order.
    pub fn from_records(records: impl IntoIterator<Item = FeedRecord>) -> Result<Self> {
        let mut grouped: BTreeMap<PoolId, (Pool, Vec<PricePoint>)> = BTreeMap::new();

        for record in records {
            let pool = Pool::new(&record.instance_type, &record.availability_zone);
            check_price(&pool.id, "spot_price", record.spot_price)?;
            check_price(&pool.id, "on_demand_price", record.on_demand_price)?;

            let point = PricePoint {
                timestamp: record.timestamp,
                spot_price: record.spot_price,
                on_demand_price: record.on_demand_price,
            };

            let pool_id = pool.id.clone();
            let (_, points) = grouped
                .entry(pool_id.clone())
                .or_insert_with(|| (pool, Vec::new()));

            match points.last_mut() {
                Some(last) if point.timestamp < last.timestamp => {
                    return Err(BacktestError::NonMonotonicTimestamps {
                        pool: pool_id.to_string(),
                        previous: last.timestamp,
                        current: point.timestamp,
                    });
                }
                Some(last) if point.timestamp == last.timestamp => *last = point,
                _ => points.push(point),
            }
        }

        if grouped.is_empty() {
            return Err(BacktestError::EmptyFeed);
        }

        let (pools, series): (Vec<_>, Vec<_>) = grouped.into_values().unzip();
        let feed = Feed { pools, series };

        info!(
            "Loaded feed: {} pools, {} observations",
            feed.pools.len(),
            feed.observation_count()
        );

        Ok(feed)
    }

    /// Read a CSV feed. The header must contain every column in [`REQUIRED_COLUMNS`];
    /// extra columns are ignored.
    pub fn from_csv_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        for column in REQUIRED_COLUMNS {
            if !headers.iter().any(|h| h == column) {
                return Err(BacktestError::missing_column(column));
            }
        }

        let mut records = Vec::new();
        for (i, result) in rdr.deserialize::<FeedRecord>().enumerate() {
            // Line 1 is the header
            let line = i as u64 + 2;
            let record = result.map_err(|e| BacktestError::invalid_record(line, e.to_string()))?;
            records.push(record);
        }
        debug!("Parsed {} CSV records", records.len());

        Self::from_records(records)
    }

    /// Read a CSV feed from disk
    pub fn from_csv_path(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        Self::from_csv_reader(std::io::BufReader::new(file))
    }

    /// Pools in lexicographic id order
    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    /// Observations per pool, parallel to [`Feed::pools`]
    pub fn series(&self) -> &[Vec<PricePoint>] {
        &self.series
    }

    /// Total number of observations
    pub fn observation_count(&self) -> usize {
        self.series.iter().map(Vec::len).sum()
    }

    /// Earliest and latest observation timestamps
    pub fn time_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        // Every pool has at least one observation, so both folds see a value.
        let start = self
            .series
            .iter()
            .filter_map(|s| s.first())
            .map(|p| p.timestamp)
            .min()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let end = self
            .series
            .iter()
            .filter_map(|s| s.last())
            .map(|p| p.timestamp)
            .max()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        (start, end)
    }
}

fn check_price(pool: &PoolId, field: &'static str, value: f64) -> Result<()> {
    if !value.is_finite() {
        return Err(BacktestError::NonFinitePrice {
            pool: pool.to_string(),
            field,
            value,
        });
    }
    if value < 0.0 {
        return Err(BacktestError::NegativePrice {
            pool: pool.to_string(),
            field,
            value,
        });
    }
    Ok(())
}
