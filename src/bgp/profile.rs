//! Z-normalized matrix profile over a bounded window.
//!
//! The profile's i-th entry is the Euclidean distance between the
//! z-normalized subsequence starting at i and its nearest non-trivial
//! neighbor, under an exclusion zone of half the subsequence length.
//! Constant subsequences normalize to the zero vector, so a flat series
//! produces a zero profile and can never look like a discord.

/// Minimum usable subsequence length.
pub const MIN_SUBSEQUENCE: usize = 4;

const STD_EPS: f64 = 1e-10;

/// Per-subsequence mean and standard deviation, via prefix sums.
fn moments(values: &[f64], w: usize) -> (Vec<f64>, Vec<f64>) {
    let m = values.len() - w + 1;
    let mut prefix = vec![0.0; values.len() + 1];
    let mut prefix_sq = vec![0.0; values.len() + 1];
    for (i, &v) in values.iter().enumerate() {
        prefix[i + 1] = prefix[i] + v;
        prefix_sq[i + 1] = prefix_sq[i] + v * v;
    }
    let mut means = Vec::with_capacity(m);
    let mut stds = Vec::with_capacity(m);
    for i in 0..m {
        let sum = prefix[i + w] - prefix[i];
        let sum_sq = prefix_sq[i + w] - prefix_sq[i];
        let mean = sum / w as f64;
        let var = (sum_sq / w as f64 - mean * mean).max(0.0);
        means.push(mean);
        stds.push(var.sqrt());
    }
    (means, stds)
}

/// Distance between the z-normalized subsequences at `i` and `j`.
fn znorm_distance(
    values: &[f64],
    w: usize,
    i: usize,
    j: usize,
    means: &[f64],
    stds: &[f64],
) -> f64 {
    let (flat_i, flat_j) = (stds[i] < STD_EPS, stds[j] < STD_EPS);
    if flat_i && flat_j {
        return 0.0;
    }
    if flat_i || flat_j {
        // One side normalizes to zeros; the other has unit variance.
        return (w as f64).sqrt();
    }
    let mut dot = 0.0;
    for k in 0..w {
        dot += values[i + k] * values[j + k];
    }
    let correlation = (dot - w as f64 * means[i] * means[j]) / (w as f64 * stds[i] * stds[j]);
    (2.0 * w as f64 * (1.0 - correlation.clamp(-1.0, 1.0))).max(0.0).sqrt()
}

/// Full matrix profile of `values` with subsequence length `w`.
///
/// Returns `None` when the series is shorter than `2 * w` or `w` is too
/// small to be meaningful. Nearest-neighbor ties resolve to the lower index.
pub fn matrix_profile(values: &[f64], w: usize) -> Option<Vec<f64>> {
    if w < MIN_SUBSEQUENCE || values.len() < 2 * w {
        return None;
    }
    let m = values.len() - w + 1;
    let exclusion = w.div_ceil(2);
    let (means, stds) = moments(values, w);

    let mut profile = Vec::with_capacity(m);
    for i in 0..m {
        let mut nearest = f64::INFINITY;
        for j in 0..m {
            if i.abs_diff(j) < exclusion {
                continue;
            }
            let d = znorm_distance(values, w, i, j, &means, &stds);
            if d < nearest {
                nearest = d;
            }
        }
        profile.push(nearest);
    }
    Some(profile)
}

/// The discord score of the window: the largest nearest-neighbor distance
/// over all subsequences, i.e. how unusual the most unusual pattern is.
pub fn max_discord(values: &[f64], w: usize) -> Option<f64> {
    matrix_profile(values, w).map(|profile| profile.into_iter().fold(0.0, f64::max))
}
