//! Synkti Backtest CLI
//!
//! ```bash
//! # Generate a synthetic feed
//! synkti-backtest synthetic --out feed.csv --pools 12 --days 120 --seed 7
//!
//! # Replay the zone heuristic and the never-switch baseline from two pools
//! synkti-backtest run --feed feed.csv --initial-pool m5.large@us-east-1a \
//!     --initial-pool c5.large@us-east-1a --out results/
//! ```

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{TimeDelta, TimeZone, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use synkti_backtest::{
    report::{write_feed, ArtifactWriter, BacktestSummary, RunSummary},
    AnySignal, Backtest, BacktestConfig, Feed, NeverSwitchPolicy, PoolId, RiskPredictions, RunSpec,
    ScoreTable, SharedRiskFacts, SyntheticFeed, ZoneHeuristicPolicy,
};

#[derive(Parser)]
#[command(name = "synkti-backtest")]
#[command(about = "Leakage-free backtests of spot pool switching policies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay policies over a price feed
    Run {
        /// Price feed CSV (timestamp, instance_type, availability_zone, spot_price, on_demand_price)
        #[arg(long)]
        feed: PathBuf,

        /// JSON configuration (missing fields take defaults)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Starting pool id, e.g. m5.large@us-east-1a (repeatable)
        #[arg(long = "initial-pool", required = true)]
        initial_pools: Vec<String>,

        /// Policies to compare (comma-separated: heuristic,never)
        #[arg(long, default_value = "heuristic,never")]
        policies: String,

        /// Anomaly predictions CSV (pool_id, timestamp, score)
        #[arg(long)]
        predictions: Option<PathBuf>,

        /// Shared risk facts CSV (pool_id, reported_at, ttl_minutes)
        #[arg(long)]
        shared_risk: Option<PathBuf>,

        /// Predicted stability scores CSV (pool_id, timestamp, score) to evaluate
        #[arg(long)]
        scores: Option<PathBuf>,

        /// Output directory for artifacts
        #[arg(long)]
        out: Option<PathBuf>,

        /// Also write the per-tick feature table
        #[arg(long)]
        features: bool,
    },

    /// Generate a synthetic multi-pool feed
    Synthetic {
        /// Output CSV path
        #[arg(long)]
        out: PathBuf,

        /// Number of pools
        #[arg(long, default_value_t = 12)]
        pools: usize,

        /// Days of history
        #[arg(long, default_value_t = 120)]
        days: i64,

        /// RNG seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "synkti_backtest=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            feed,
            config,
            initial_pools,
            policies,
            predictions,
            shared_risk,
            scores,
            out,
            features,
        } => run(RunArgs {
            feed,
            config,
            initial_pools,
            policies,
            predictions,
            shared_risk,
            scores,
            out,
            features,
        }),
        Commands::Synthetic {
            out,
            pools,
            days,
            seed,
        } => synthetic(out, pools, days, seed),
    }
}

struct RunArgs {
    feed: PathBuf,
    config: Option<PathBuf>,
    initial_pools: Vec<String>,
    policies: String,
    predictions: Option<PathBuf>,
    shared_risk: Option<PathBuf>,
    scores: Option<PathBuf>,
    out: Option<PathBuf>,
    features: bool,
}

fn run(args: RunArgs) -> Result<()> {
    let config = match &args.config {
        Some(path) => {
            let json = fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            BacktestConfig::from_json(&json)?
        }
        None => BacktestConfig::default(),
    };

    let feed = Feed::from_csv_path(&args.feed)
        .with_context(|| format!("loading feed {}", args.feed.display()))?;

    let mut signal = AnySignal::new();
    if let Some(path) = &args.predictions {
        let table = ScoreTable::from_csv_path(path)
            .with_context(|| format!("loading predictions {}", path.display()))?;
        signal = signal.with(RiskPredictions::new(table, config.decision_threshold));
    }
    if let Some(path) = &args.shared_risk {
        let file = fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
        signal = signal.with(SharedRiskFacts::from_csv_reader(file)?);
    }

    let mut backtest = Backtest::prepare(&feed, config)?;
    if !signal.is_empty() {
        backtest = backtest.with_signal(signal);
    }

    let mut specs = Vec::new();
    for policy in args.policies.split(',').map(str::trim) {
        for pool in &args.initial_pools {
            let id = PoolId::new(pool.as_str());
            let name = format!("{}:{}", policy, id);
            match policy {
                "heuristic" => specs.push(RunSpec::new(name, id, ZoneHeuristicPolicy::new())),
                "never" => specs.push(RunSpec::new(name, id, NeverSwitchPolicy)),
                other => bail!("Unknown policy: {}", other),
            }
        }
    }

    let outcomes = backtest.run_many(&specs, None);

    let mut runs = Vec::new();
    for (spec, outcome) in specs.iter().zip(outcomes) {
        match outcome {
            Ok(outcome) => runs.push((spec.name.clone(), outcome)),
            Err(e) => warn!("Run {} failed: {}", spec.name, e),
        }
    }
    if runs.is_empty() {
        bail!("no run completed");
    }

    let held_out_error = match &args.scores {
        Some(path) => {
            let predicted = ScoreTable::from_csv_path(path)
                .with_context(|| format!("loading scores {}", path.display()))?;
            backtest.evaluate_scores(&predicted)
        }
        None => None,
    };

    println!("\n╔══════════════════════════════════════════════════════════╗");
    println!("║  Backtest Results                                        ║");
    println!("╚══════════════════════════════════════════════════════════╝\n");
    println!(
        "  Grid: {} pools × {} ticks ({}), test from {}\n",
        backtest.grid().pools().len(),
        backtest.grid().len(),
        backtest.config().resample_freq,
        backtest.split_at()
    );

    println!(
        "{:<40} {:>12} {:>12} {:>10} {:>9} {:>8}",
        "Run", "Cost ($)", "Baseline ($)", "Savings", "Switches", "No-ops"
    );
    println!("{}", "-".repeat(96));
    for (name, outcome) in &runs {
        let savings = outcome
            .savings_pct
            .map(|s| format!("{:.1}%", s))
            .unwrap_or_else(|| "N/A".to_string());
        println!(
            "{:<40} {:>12.4} {:>12.4} {:>10} {:>9} {:>8}",
            name,
            outcome.total_cost,
            outcome.baseline_cost,
            savings,
            outcome.switch_count(),
            outcome.no_switch_attempts.len()
        );
    }

    if let Some(error) = &held_out_error {
        println!(
            "\nHeld-out stability error ({} labels): MAE {:.3}, RMSE {:.3}, R² {}",
            error.count,
            error.mae,
            error.rmse,
            error
                .r_squared
                .map(|r| format!("{:.3}", r))
                .unwrap_or_else(|| "N/A".to_string())
        );
    }

    let diagnostics = backtest.diagnostics();
    if !diagnostics.is_empty() {
        println!("\n{} data diagnostics (see summary.json)", diagnostics.len());
    }

    if let Some(dir) = &args.out {
        let writer = ArtifactWriter::new(dir)?;
        writer.write_tables(&backtest, args.features)?;

        let named: Vec<(&str, &_)> = runs.iter().map(|(n, o)| (n.as_str(), o)).collect();
        writer.write_runs(&named)?;

        let summaries = runs.iter().map(|(n, o)| RunSummary::new(n.as_str(), o)).collect();
        writer.write_summary(&BacktestSummary::new(&backtest, summaries, held_out_error))?;
        println!("\nArtifacts written to {}", writer.dir().display());
    }

    println!("\n✅ Backtest complete!\n");
    Ok(())
}

fn synthetic(out: PathBuf, pools: usize, days: i64, seed: u64) -> Result<()> {
    if pools == 0 || days <= 0 {
        bail!("--pools and --days must be positive");
    }

    let start = Utc
        .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .context("invalid start date")?;
    let records = SyntheticFeed::standard(pools, seed).generate(start, TimeDelta::days(days))?;

    let file = fs::File::create(&out).with_context(|| format!("creating {}", out.display()))?;
    write_feed(std::io::BufWriter::new(file), &records)?;

    info!("Wrote {} records to {}", records.len(), out.display());
    println!("✅ Synthetic feed written to {}", out.display());
    Ok(())
}
