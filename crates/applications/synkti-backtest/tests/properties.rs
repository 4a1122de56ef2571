//! Leakage and determinism properties over randomized feeds

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use proptest::prelude::*;
use synkti_backtest::{
    Backtest, BacktestConfig, Feed, FeedRecord, PoolId, RunSpec, SimulationOutcome, ZoneThresholds,
};

const POOLS: [(&str, &str); 4] = [
    ("m5.large", "us-east-1a"),
    ("m5.xlarge", "us-east-1a"),
    ("m5.large", "us-east-1b"),
    ("c5.large", "us-east-1a"),
];
const SPLIT: usize = 12;
/// Ticks before the quarter boundary
const QUARTER_TICKS: usize = 24;

/// One day before the Q1/Q2 boundary, so later ticks get purple baselines
fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 31, 0, 0, 0).unwrap()
}

fn feed(prices: &[Vec<f64>]) -> Feed {
    let records = POOLS.iter().zip(prices).flat_map(|((ty, az), series)| {
        series.iter().enumerate().map(move |(i, p)| {
            FeedRecord::new(start() + TimeDelta::hours(i as i64), *ty, *az, *p, 1.0)
        })
    });
    Feed::from_records(records).unwrap()
}

fn config() -> BacktestConfig {
    BacktestConfig {
        volatility_window_hours: 3.0,
        spike_threshold: 1.2,
        ..BacktestConfig::default()
    }
    .with_resample_freq("1h")
    .with_split_at(start() + TimeDelta::hours(SPLIT as i64))
    .with_lookahead_ticks(3)
}

fn thresholds(backtest: &Backtest) -> Vec<ZoneThresholds> {
    backtest.zones().table().cloned().collect()
}

fn run(backtest: &Backtest) -> SimulationOutcome {
    backtest
        .run(&RunSpec::heuristic(PoolId::from("m5.large@us-east-1a")), None)
        .unwrap()
}

/// Price matrix `[pool][tick]` with a cut tick in the test period
fn market() -> impl Strategy<Value = (Vec<Vec<f64>>, Vec<Vec<f64>>, usize)> {
    (QUARTER_TICKS + 8..QUARTER_TICKS + 28).prop_flat_map(|n_ticks| {
        let matrix = || prop::collection::vec(prop::collection::vec(0.05f64..0.95, n_ticks), POOLS.len());
        (matrix(), matrix(), SPLIT..n_ticks)
    })
}

/// Keep `base` up to and including `cut`, take `other` after it
fn splice(base: &[Vec<f64>], other: &[Vec<f64>], cut: usize) -> Vec<Vec<f64>> {
    base.iter()
        .zip(other)
        .map(|(b, o)| b[..=cut].iter().chain(&o[cut + 1..]).copied().collect())
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn test_future_prices_do_not_change_past_decisions((base, other, cut) in market()) {
        let original = Backtest::prepare(&feed(&base), config()).unwrap();
        let mutated = Backtest::prepare(&feed(&splice(&base, &other, cut)), config()).unwrap();
        let cut_ts = original.grid().timestamp(cut);

        prop_assert_eq!(thresholds(&original), thresholds(&mutated));

        for tick in 0..=cut {
            prop_assert_eq!(
                original.features().compute_tick(original.grid().snapshot(tick)),
                mutated.features().compute_tick(mutated.grid().snapshot(tick))
            );
            for pool in 0..POOLS.len() {
                prop_assert_eq!(
                    original.purple().is_flagged(pool, tick),
                    mutated.purple().is_flagged(pool, tick)
                );
            }
        }

        let a = run(&original);
        let b = run(&mutated);
        let before = |o: &SimulationOutcome| {
            o.switch_log.iter().filter(|e| e.timestamp <= cut_ts).cloned().collect::<Vec<_>>()
        };
        prop_assert_eq!(before(&a), before(&b));
    }

    #[test]
    fn test_thresholds_isolated_from_test_split((base, other, _cut) in market()) {
        let original = Backtest::prepare(&feed(&base), config()).unwrap();
        let mutated = Backtest::prepare(&feed(&splice(&base, &other, SPLIT - 1)), config()).unwrap();

        prop_assert_eq!(thresholds(&original), thresholds(&mutated));
        prop_assert_eq!(original.stability_thresholds(), mutated.stability_thresholds());
    }

    #[test]
    fn test_pipeline_is_idempotent_and_deterministic((base, _other, _cut) in market()) {
        let first = Backtest::prepare(&feed(&base), config()).unwrap();
        let second = Backtest::prepare(&feed(&base), config()).unwrap();

        prop_assert_eq!(thresholds(&first), thresholds(&second));
        prop_assert_eq!(run(&first), run(&second));
    }

    #[test]
    fn test_no_labels_in_tail((base, _other, _cut) in market()) {
        let backtest = Backtest::prepare(&feed(&base), config()).unwrap();
        let grid = backtest.grid();
        let horizon = backtest.config().lookahead_ticks;
        let last_labelled = grid.timestamp(grid.len() - 1 - horizon);

        prop_assert!(backtest.labels().iter().all(|l| l.timestamp <= last_labelled));
        prop_assert_eq!(backtest.labels().len(), POOLS.len() * (grid.len() - horizon));
    }

    #[test]
    fn test_forward_fill_holds_last_observation(
        first in 0.05f64..0.95,
        second in 0.05f64..0.95,
        gap in 1i64..6,
    ) {
        let records = vec![
            FeedRecord::new(start(), "m5.large", "us-east-1a", first, 1.0),
            FeedRecord::new(start() + TimeDelta::hours(gap), "m5.large", "us-east-1a", second, 1.0),
            FeedRecord::new(start() + TimeDelta::hours(gap + 2), "c5.large", "us-east-1a", 0.5, 1.0),
        ];
        let feed = Feed::from_records(records).unwrap();
        let grid = synkti_backtest::MarketGrid::synchronize(&feed, TimeDelta::hours(1)).unwrap();
        let m5 = grid.require_pool(&PoolId::from("m5.large@us-east-1a")).unwrap();
        let c5 = grid.require_pool(&PoolId::from("c5.large@us-east-1a")).unwrap();

        for tick in 0..gap as usize {
            prop_assert_eq!(grid.price(m5, tick).map(|p| p.spot_price), Some(first));
        }
        prop_assert_eq!(grid.price(m5, gap as usize).map(|p| p.spot_price), Some(second));
        // No back-fill before a pool's first observation
        prop_assert!(grid.price(c5, gap as usize + 1).is_none());
        prop_assert_eq!(grid.price(c5, gap as usize + 2).map(|p| p.spot_price), Some(0.5));
    }
}

#[test]
fn test_purple_flags_before_cut_survive_future_changes() {
    // Gentle swings through Q1, wide swings once Q2 starts
    let base: Vec<Vec<f64>> = (0..POOLS.len())
        .map(|pool| {
            (0..QUARTER_TICKS + 12)
                .map(|i| {
                    let amplitude = if i < QUARTER_TICKS { 0.02 } else { 0.30 };
                    0.40 + pool as f64 * 0.01 + if i % 2 == 0 { amplitude } else { 0.0 }
                })
                .collect()
        })
        .collect();
    let calm: Vec<Vec<f64>> = base.iter().map(|s| vec![0.40; s.len()]).collect();
    let cut = QUARTER_TICKS + 5;

    let original = Backtest::prepare(&feed(&base), config()).unwrap();
    let mutated = Backtest::prepare(&feed(&splice(&base, &calm, cut)), config()).unwrap();

    let flagged = |b: &Backtest, ticks: std::ops::Range<usize>| {
        ticks
            .flat_map(|t| (0..POOLS.len()).map(move |p| (p, t)))
            .filter(|&(p, t)| b.purple().is_flagged(p, t))
            .collect::<Vec<_>>()
    };
    let before_cut = flagged(&original, 0..cut + 1);
    assert!(!before_cut.is_empty());
    assert!(before_cut.iter().all(|&(_, t)| t >= QUARTER_TICKS));
    assert_eq!(before_cut, flagged(&mutated, 0..cut + 1));
    // Calm prices after the cut clear the flags once the window rolls past it
    assert!(flagged(&mutated, cut + 4..QUARTER_TICKS + 12).is_empty());
}
