//! Threshold selection for the per-bin log null posteriors
//!
//! The estimator sweeps log-spaced thresholds from strict to relaxed, maps
//! each to a (candidate count, mean length) point, finds the characteristic
//! triangle of the resulting curve and picks the threshold at which newly
//! appearing candidates are rarest. No user-tuned threshold is involved.
//!

use std::ops::Range;

use itertools::{Itertools, MinMaxResult};
use log::{debug, info, warn};

use crate::candidates::aggregate_bins;
use crate::error::{CancelToken, OmnipeakResult};
use crate::hmm::LOG_NULL_CEILING;

/// Number of thresholds in one sweep
const SWEEP_STEPS: usize = 100;

/// A longer run of identical candidate counts at the relaxed end of the
/// sweep triggers a re-run on the truncated range
const MAX_DEGENERATE_RUN: usize = 5;

/// Lower bound on the first triangle index, as a fraction of the sweep
const MIN_BEFORE_MERGE_FRACTION: f64 = 0.2;

pub struct SensitivityResult {
    /// The chosen log-PEP threshold t*
    pub threshold: f64,
    /// Stricter secondary threshold for the summit-refining pass
    pub summit_threshold: Option<f64>,
    /// True when the triangle search failed and ln(FDR) was used
    pub fallback: bool,
}

/// Candidate count and mean bin length over all chromosomes at one threshold
///
fn sweep_point(log_null: &[Vec<f32>], threshold: f64) -> (usize, f64) {
    let mut count = 0usize;
    let mut total_len = 0usize;
    for chrom in log_null.iter() {
        let mut run_open = false;
        for value in chrom.iter() {
            if (*value as f64) <= threshold {
                if !run_open {
                    count += 1;
                    run_open = true;
                }
                total_len += 1;
            } else {
                run_open = false;
            }
        }
    }
    let mean_len = if count > 0 {
        total_len as f64 / count as f64
    } else {
        0.0
    };
    (count, mean_len)
}

/// Log-spaced thresholds between two negative bounds, strict to relaxed
///
fn log_spaced_thresholds(min_value: f64, max_value: f64, steps: usize) -> Vec<f64> {
    assert!(min_value < 0.0 && max_value < 0.0 && min_value <= max_value);
    let ln_lo = (-min_value).ln();
    let ln_hi = (-max_value).ln();
    (0..steps)
        .map(|i| {
            let frac = i as f64 / (steps - 1) as f64;
            -(ln_lo + frac * (ln_hi - ln_lo)).exp()
        })
        .collect()
}

/// Length of the trailing run of identical counts
///
fn trailing_equal_run(counts: &[usize]) -> usize {
    let last = match counts.last() {
        Some(last) => *last,
        None => return 0,
    };
    counts.iter().rev().take_while(|c| **c == last).count()
}

/// Absolute signed area of the triangle over curve points a, b, c
///
fn triangle_area(points: &[(f64, f64)], a: usize, b: usize, c: usize) -> f64 {
    let (xa, ya) = points[a];
    let (xb, yb) = points[b];
    let (xc, yc) = points[c];
    ((xb - xa) * (yc - ya) - (xc - xa) * (yb - ya)).abs() / 2.0
}

/// Locate the triangle indices i1 < i2 < i3 on the sweep curve
///
/// The indices maximize the geometric mean of the areas of triangles
/// (0, i1, i2) and (i2, i3, last); i2 sits at the candidate count maximum
/// and i1 is constrained away from the strict end of the sweep.
///
fn find_triangle(points: &[(f64, f64)], counts: &[usize]) -> Option<(usize, usize, usize)> {
    let n = points.len();
    let last = n - 1;
    // First index reaching the count maximum, so that a plateau at the top
    // of the curve leaves room for the third triangle point
    let max_count = *counts.iter().max()?;
    let i2 = counts.iter().position(|c| *c == max_count)?;
    let min_i1 = ((n as f64 * MIN_BEFORE_MERGE_FRACTION).ceil() as usize).max(1);
    if i2 <= min_i1 || i2 + 1 >= last {
        return None;
    }

    let objective = |i1: usize, i3: usize| {
        (triangle_area(points, 0, i1, i2) * triangle_area(points, i2, i3, last)).sqrt()
    };

    let mut best = None;
    let mut best_value = 0.0f64;
    for i1 in min_i1..i2 {
        for i3 in i2 + 1..last {
            let value = objective(i1, i3);
            if value > best_value {
                best_value = value;
                best = Some((i1, i3));
            }
        }
    }
    let (mut i1, mut i3) = best?;

    // Refine the flanking indices toward the stable point
    while i1 + 1 < i2 && objective(i1 + 1, i3) >= objective(i1, i3) {
        i1 += 1;
    }
    while i3 > i2 + 1 && objective(i1, i3 - 1) >= objective(i1, i3) {
        i3 -= 1;
    }
    Some((i1, i2, i3))
}

/// Candidate runs per chromosome at one threshold, gap zero
///
fn threshold_runs(log_null: &[Vec<f32>], threshold: f64) -> Vec<Vec<Range<usize>>> {
    log_null
        .iter()
        .map(|chrom| {
            let mask = chrom
                .iter()
                .map(|value| (*value as f64) <= threshold)
                .collect::<Vec<_>>();
            aggregate_bins(&mask, 0)
        })
        .collect()
}

/// Count candidates at the relaxed threshold with no counterpart at the
/// stricter one
///
fn count_new_candidates(
    strict: &[Vec<Range<usize>>],
    relaxed: &[Vec<Range<usize>>],
) -> (usize, usize) {
    let mut new = 0usize;
    let mut total = 0usize;
    for (strict_runs, relaxed_runs) in strict.iter().zip(relaxed.iter()) {
        total += relaxed_runs.len();
        let mut strict_iter = strict_runs.iter().peekable();
        for run in relaxed_runs.iter() {
            while let Some(prev) = strict_iter.peek() {
                if prev.end <= run.start {
                    strict_iter.next();
                } else {
                    break;
                }
            }
            let intersects = strict_iter
                .peek()
                .map(|prev| prev.start < run.end)
                .unwrap_or(false);
            if !intersects {
                new += 1;
            }
        }
    }
    (new, total)
}

/// Choose the log-PEP threshold from the genome-wide log null posteriors
///
/// `log_null` holds only the chromosomes included in the analysis. Falls
/// back to ln(FDR) when the sweep curve carries no usable triangle.
///
pub fn estimate_sensitivity(
    log_null: &[Vec<f32>],
    fdr: f64,
    cancel: &CancelToken,
) -> OmnipeakResult<SensitivityResult> {
    let fallback = |reason: &str| {
        warn!("Sensitivity estimation fallback to ln(FDR): {reason}");
        SensitivityResult {
            threshold: fdr.ln(),
            summit_threshold: None,
            fallback: true,
        }
    };

    let (min_value, max_value) = match log_null
        .iter()
        .flatten()
        .map(|v| *v as f64)
        .minmax()
    {
        MinMaxResult::MinMax(min, max) => (min, max),
        _ => return Ok(fallback("log null posteriors carry no dynamic range")),
    };
    if !min_value.is_finite() || min_value >= LOG_NULL_CEILING {
        return Ok(fallback("log null posteriors carry no dynamic range"));
    }
    let mut max_value = max_value.min(LOG_NULL_CEILING);

    let mut thresholds;
    let mut counts;
    let mut mean_lengths;
    let mut rerun = 0usize;
    loop {
        cancel.checkpoint()?;
        thresholds = log_spaced_thresholds(min_value, max_value, SWEEP_STEPS);
        counts = Vec::with_capacity(SWEEP_STEPS);
        mean_lengths = Vec::with_capacity(SWEEP_STEPS);
        for threshold in thresholds.iter() {
            cancel.checkpoint()?;
            let (count, mean_len) = sweep_point(log_null, *threshold);
            counts.push(count);
            mean_lengths.push(mean_len);
        }

        let run = trailing_equal_run(&counts);
        if run <= MAX_DEGENERATE_RUN || rerun >= 2 {
            break;
        }
        // Degenerate top of the sweep: truncate the relaxed end and re-run
        let truncated = thresholds[SWEEP_STEPS - run];
        debug!(
            "Degenerate sweep top ({} equal counts), truncating range to {:.4e}",
            run, truncated
        );
        if truncated <= min_value {
            break;
        }
        max_value = truncated;
        rerun += 1;
    }

    let points = counts
        .iter()
        .zip(mean_lengths.iter())
        .map(|(n, len)| ((1.0 + *n as f64).ln(), (1.0 + len).ln()))
        .collect::<Vec<_>>();

    let (i1, i2, _i3) = match find_triangle(&points, &counts) {
        Some(triangle) => triangle,
        None => return Ok(fallback("no sensitivity triangle on the sweep curve")),
    };
    debug!(
        "Sensitivity triangle at sweep indices ({i1}, {i2}, {_i3}), thresholds \
         ({:.4}, {:.4}, {:.4})",
        thresholds[i1], thresholds[i2], thresholds[_i3]
    );

    // Additive-candidate analysis over the before-merge..stable range: pick
    // the threshold where the fewest candidates appear de novo
    let mut best_index = None;
    let mut best_ratio = f64::INFINITY;
    let mut strict_runs = threshold_runs(log_null, thresholds[i1 - 1]);
    for index in i1..i2 {
        cancel.checkpoint()?;
        let relaxed_runs = threshold_runs(log_null, thresholds[index]);
        let (new, total) = count_new_candidates(&strict_runs, &relaxed_runs);
        if total > 0 {
            let ratio = new as f64 / total as f64;
            if ratio < best_ratio {
                best_ratio = ratio;
                best_index = Some(index);
            }
        }
        strict_runs = relaxed_runs;
    }

    let chosen = match best_index {
        Some(index) => index,
        None => return Ok(fallback("no candidates inside the triangle range")),
    };
    info!(
        "Sensitivity threshold {:.4} (new/total ratio {:.4}), summit threshold {:.4}",
        thresholds[chosen], best_ratio, thresholds[i1]
    );

    Ok(SensitivityResult {
        threshold: thresholds[chosen],
        summit_threshold: Some(thresholds[i1]),
        fallback: false,
    })
}
