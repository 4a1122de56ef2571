//! Small numeric helpers shared by the threshold, feature and label code

/// Percentile (0-100) with linear interpolation between closest ranks.
///
/// `sorted` must be ascending and free of NaN. Returns `None` when empty.
pub fn percentile_sorted(sorted: &[f64], pct: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    if n == 1 {
        return Some(sorted[0]);
    }

    let rank = (pct.clamp(0.0, 100.0) / 100.0) * (n - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;

    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Sort a copy of `values` (NaN dropped) for repeated percentile queries
pub fn sorted_finite(values: impl IntoIterator<Item = f64>) -> Vec<f64> {
    let mut out: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
    out.sort_by(f64::total_cmp);
    out
}

/// Median of unsorted values
pub fn median(values: impl IntoIterator<Item = f64>) -> Option<f64> {
    percentile_sorted(&sorted_finite(values), 50.0)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Sample standard deviation (n - 1). Needs at least two values.
///
/// Values are shifted by the first element before accumulating, so a window
/// of identical prices yields exactly zero.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let shift = values[0];
    let n = values.len() as f64;
    let mean_dev = values.iter().map(|v| v - shift).sum::<f64>() / n;
    let ss: f64 = values
        .iter()
        .map(|v| {
            let d = v - shift - mean_dev;
            d * d
        })
        .sum();
    Some((ss / (n - 1.0)).sqrt())
}

/// Trailing sample standard deviation over `window` values at every position.
///
/// Sliding Welford update, O(1) per position. `None` until two values are in
/// the window. A window of identical values yields exactly zero.
pub fn rolling_sample_std(values: &[f64], window: usize) -> Vec<Option<f64>> {
    if window < 2 {
        return vec![None; values.len()];
    }
    let mut out = Vec::with_capacity(values.len());
    let (mut count, mut mean, mut m2) = (0usize, 0.0f64, 0.0f64);
    // Trailing run of values equal to the latest one
    let mut equal_run = 0usize;

    for (i, &x) in values.iter().enumerate() {
        equal_run = if i > 0 && values[i - 1] == x { equal_run + 1 } else { 1 };

        if count == window {
            let y = values[i - window];
            let next_mean = mean + (mean - y) / (count - 1) as f64;
            m2 -= (y - mean) * (y - next_mean);
            mean = next_mean;
            count -= 1;
        }
        count += 1;
        let delta = x - mean;
        mean += delta / count as f64;
        m2 += delta * (x - mean);

        if equal_run >= count {
            // Reseed so earlier rounding cannot leak into a flat window
            mean = x;
            m2 = 0.0;
        }

        out.push((count >= 2).then(|| (m2.max(0.0) / (count - 1) as f64).sqrt()));
    }
    out
}

/// Least-squares slope of `values` against their index
pub fn ols_slope(values: &[f64]) -> Option<f64> {
    let n = values.len();
    if n < 2 {
        return None;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = values.iter().sum::<f64>() / n as f64;

    let (mut num, mut den) = (0.0, 0.0);
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - x_mean;
        num += dx * (y - y_mean);
        den += dx * dx;
    }
    Some(num / den)
}

/// Percentile rank of `value` within ascending `sorted`, ties averaged.
///
/// Matches a 1-based average rank divided by the group size, so the single
/// member of a group ranks 1.0.
pub fn percentile_rank(sorted: &[f64], value: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let less = sorted.partition_point(|v| *v < value);
    let less_or_equal = sorted.partition_point(|v| *v <= value);
    let equal = less_or_equal - less;
    (less as f64 + (equal as f64 + 1.0) / 2.0) / n as f64
}
