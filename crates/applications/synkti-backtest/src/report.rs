//! Output artifacts
//!
//! | File                    | One row per        |
//! |-------------------------|--------------------|
//! | `zone_thresholds.csv`   | pool               |
//! | `purple_flags.csv`      | pool and quarter   |
//! | `switch_log.csv`        | switch, all runs   |
//! | `no_switch_log.csv`     | no-op attempt      |
//! | `stability_labels.csv`  | labelled pool/tick |
//! | `features.csv`          | pool/tick          |
//! | `summary.json`          | backtest           |

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backtest::Backtest;
use crate::config::BacktestConfig;
use crate::error::Result;
use crate::feed::FeedRecord;
use crate::simulator::{NoSwitchReason, SimulationOutcome};
use crate::stability::HeldOutError;
use crate::types::{PoolId, TriggerReason};
use crate::zones::{Diagnostic, PurpleFlags, ZoneModel};

/// Headline numbers of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub name: String,
    pub policy: String,
    pub initial_pool: PoolId,
    pub final_pool: PoolId,
    pub total_cost: f64,
    pub holding_cost: f64,
    pub switching_cost: f64,
    pub baseline_cost: f64,
    pub savings_pct: Option<f64>,
    pub switch_count: usize,
    pub no_switch_attempts: usize,
    pub completed_ticks: usize,
    pub cancelled: bool,
}

impl RunSummary {
    pub fn new(name: impl Into<String>, outcome: &SimulationOutcome) -> Self {
        RunSummary {
            name: name.into(),
            policy: outcome.policy_name.clone(),
            initial_pool: outcome.initial_pool.clone(),
            final_pool: outcome.final_pool.clone(),
            total_cost: outcome.total_cost,
            holding_cost: outcome.holding_cost,
            switching_cost: outcome.switching_cost,
            baseline_cost: outcome.baseline_cost,
            savings_pct: outcome.savings_pct,
            switch_count: outcome.switch_count(),
            no_switch_attempts: outcome.no_switch_attempts.len(),
            completed_ticks: outcome.completed_ticks,
            cancelled: outcome.cancelled,
        }
    }
}

/// Contents of `summary.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestSummary {
    pub config: BacktestConfig,
    pub grid_start: DateTime<Utc>,
    pub grid_end: DateTime<Utc>,
    pub ticks: usize,
    pub pools: usize,
    pub split_at: DateTime<Utc>,
    pub stability_labels: usize,
    pub runs: Vec<RunSummary>,
    pub held_out_error: Option<HeldOutError>,
    pub diagnostics: Vec<Diagnostic>,
}

impl BacktestSummary {
    pub fn new(backtest: &Backtest, runs: Vec<RunSummary>, held_out_error: Option<HeldOutError>) -> Self {
        let grid = backtest.grid();
        BacktestSummary {
            config: backtest.config().clone(),
            grid_start: grid.timestamp(0),
            grid_end: grid.timestamp(grid.len() - 1),
            ticks: grid.len(),
            pools: grid.pools().len(),
            split_at: backtest.split_at(),
            stability_labels: backtest.labels().len(),
            runs,
            held_out_error,
            diagnostics: backtest.diagnostics(),
        }
    }
}

#[derive(Debug, Serialize)]
struct PurpleRow<'a> {
    pool_id: &'a PoolId,
    quarter: String,
    baseline: Option<f64>,
    ticks: usize,
    flagged_ticks: usize,
}

#[derive(Debug, Serialize)]
struct SwitchRow<'a> {
    run: &'a str,
    timestamp: DateTime<Utc>,
    from_pool: &'a PoolId,
    to_pool: &'a PoolId,
    cost: f64,
    trigger_reason: TriggerReason,
}

#[derive(Debug, Serialize)]
struct NoSwitchRow<'a> {
    run: &'a str,
    timestamp: DateTime<Utc>,
    pool_id: &'a PoolId,
    trigger_reason: TriggerReason,
    reason: NoSwitchReason,
}

/// Serialize rows as CSV with a header
pub fn write_csv<W: Write, T: Serialize>(writer: W, rows: impl IntoIterator<Item = T>) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    for row in rows {
        csv.serialize(row)?;
    }
    csv.flush()?;
    Ok(())
}

pub fn write_zone_thresholds<W: Write>(writer: W, zones: &ZoneModel) -> Result<()> {
    write_csv(writer, zones.table())
}

pub fn write_purple_flags<W: Write>(writer: W, purple: &PurpleFlags) -> Result<()> {
    write_csv(
        writer,
        purple.rows().iter().map(|r| PurpleRow {
            pool_id: &r.pool_id,
            quarter: r.quarter.to_string(),
            baseline: r.baseline,
            ticks: r.ticks,
            flagged_ticks: r.flagged_ticks,
        }),
    )
}

/// Switch events of named runs, one file
pub fn write_switch_log<W: Write>(writer: W, runs: &[(&str, &SimulationOutcome)]) -> Result<()> {
    write_csv(
        writer,
        runs.iter().flat_map(|&(name, outcome)| {
            outcome.switch_log.iter().map(move |e| SwitchRow {
                run: name,
                timestamp: e.timestamp,
                from_pool: &e.from_pool,
                to_pool: &e.to_pool,
                cost: e.cost,
                trigger_reason: e.trigger_reason,
            })
        }),
    )
}

pub fn write_no_switch_log<W: Write>(writer: W, runs: &[(&str, &SimulationOutcome)]) -> Result<()> {
    write_csv(
        writer,
        runs.iter().flat_map(|&(name, outcome)| {
            outcome.no_switch_attempts.iter().map(move |a| NoSwitchRow {
                run: name,
                timestamp: a.timestamp,
                pool_id: &a.pool_id,
                trigger_reason: a.trigger_reason,
                reason: a.reason,
            })
        }),
    )
}

/// Write a raw feed in the input CSV layout
pub fn write_feed<W: Write>(writer: W, records: &[FeedRecord]) -> Result<()> {
    write_csv(writer, records)
}

/// Writes every artifact of a backtest into one directory
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    /// Create the output directory if needed
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(ArtifactWriter { dir })
    }

    fn create(&self, name: &str) -> Result<BufWriter<File>> {
        Ok(BufWriter::new(File::create(self.dir.join(name))?))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tables derived from the market data alone
    pub fn write_tables(&self, backtest: &Backtest, include_features: bool) -> Result<()> {
        write_zone_thresholds(self.create("zone_thresholds.csv")?, backtest.zones())?;
        write_purple_flags(self.create("purple_flags.csv")?, backtest.purple())?;
        write_csv(self.create("stability_labels.csv")?, backtest.labels())?;
        if include_features {
            let table = backtest.feature_table();
            write_csv(self.create("features.csv")?, table.export(backtest.grid()))?;
        }
        info!("Wrote market tables to {}", self.dir.display());
        Ok(())
    }

    /// Switch and no-op logs of named runs
    pub fn write_runs(&self, runs: &[(&str, &SimulationOutcome)]) -> Result<()> {
        write_switch_log(self.create("switch_log.csv")?, runs)?;
        write_no_switch_log(self.create("no_switch_log.csv")?, runs)?;
        Ok(())
    }

    pub fn write_summary(&self, summary: &BacktestSummary) -> Result<()> {
        let mut out = self.create("summary.json")?;
        serde_json::to_writer_pretty(&mut out, summary)?;
        out.flush()?;
        info!("Wrote summary to {}", self.dir.join("summary.json").display());
        Ok(())
    }
}
