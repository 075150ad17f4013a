//! Kernel-density summit detection inside candidate intervals
//!

use std::ops::Range;

/// Default kernel bandwidth in bins
pub const DEFAULT_SUMMIT_BANDWIDTH: usize = 10;

/// Minimum mode length, in bandwidth multiples
const MIN_MODE_LENGTH_FACTOR: usize = 3;

/// Minimum distance between neighboring modes, in bandwidth multiples
const MIN_MODE_DISTANCE_FACTOR: usize = 2;

/// Relative slope under which the smoothed curve counts as flat
const FLAT_SLOPE_FRACTION: f64 = 0.01;

/// Number of consecutive flat steps that end a mode expansion
const SUSTAINED_FLAT_STEPS: usize = 3;

/// Area-normalized Gaussian kernel with sigma = bandwidth / 2 and radius
/// ceil(bandwidth / 2)
///
pub fn gaussian_kernel(bandwidth: usize) -> Vec<f64> {
    assert!(bandwidth > 0);
    let sigma = bandwidth as f64 / 2.0;
    let radius = (bandwidth as f64 / 2.0).ceil() as i64;
    let mut kernel = (-radius..=radius)
        .map(|offset| {
            let z = offset as f64 / sigma;
            (-0.5 * z * z).exp()
        })
        .collect::<Vec<_>>();
    let total: f64 = kernel.iter().sum();
    for weight in kernel.iter_mut() {
        *weight /= total;
    }
    kernel
}

/// Smooth a signal with the kernel, renormalizing at the boundaries so the
/// curve does not droop at the candidate edges
///
pub fn smooth(signal: &[f64], kernel: &[f64]) -> Vec<f64> {
    let radius = (kernel.len() / 2) as i64;
    let n = signal.len() as i64;
    (0..n)
        .map(|center| {
            let mut value = 0.0;
            let mut weight_in_range = 0.0;
            for (k, weight) in kernel.iter().enumerate() {
                let position = center + k as i64 - radius;
                if position >= 0 && position < n {
                    value += weight * signal[position as usize];
                    weight_in_range += weight;
                }
            }
            value / weight_in_range
        })
        .collect()
}

/// Indices of local maxima of the smoothed signal
///
fn local_maxima(smoothed: &[f64]) -> Vec<usize> {
    let n = smoothed.len();
    (0..n)
        .filter(|&i| {
            let left_ok = i == 0 || smoothed[i] >= smoothed[i - 1];
            let right_ok = i + 1 == n || smoothed[i] > smoothed[i + 1];
            left_ok && right_ok
        })
        .collect()
}

/// Expand one local maximum to a mode range
///
/// Walks outward while the smoothed value is non-increasing, stopping when a
/// sustained near-zero slope is seen.
///
fn expand_mode(smoothed: &[f64], peak: usize) -> Range<usize> {
    let slope_eps = FLAT_SLOPE_FRACTION * smoothed[peak].abs();

    let mut left = peak;
    let mut flat = 0usize;
    while left > 0 {
        let delta = smoothed[left - 1] - smoothed[left];
        if delta > 0.0 {
            break;
        }
        if delta.abs() <= slope_eps {
            flat += 1;
            if flat >= SUSTAINED_FLAT_STEPS {
                break;
            }
        } else {
            flat = 0;
        }
        left -= 1;
    }

    let mut right = peak;
    let mut flat = 0usize;
    while right + 1 < smoothed.len() {
        let delta = smoothed[right + 1] - smoothed[right];
        if delta > 0.0 {
            break;
        }
        if delta.abs() <= slope_eps {
            flat += 1;
            if flat >= SUSTAINED_FLAT_STEPS {
                break;
            }
        } else {
            flat = 0;
        }
        right += 1;
    }

    left..right + 1
}

/// Extend a mode symmetrically to the minimum length, bounded by the
/// candidate extent
///
fn enforce_min_length(mode: Range<usize>, min_length: usize, limit: usize) -> Range<usize> {
    if mode.len() >= min_length {
        return mode;
    }
    let deficit = min_length - mode.len();
    let extend_left = (deficit / 2).min(mode.start);
    let start = mode.start - extend_left;
    let end = (mode.end + (deficit - extend_left)).min(limit);
    start..end
}

/// Resolve modes closer than the minimum distance by trimming both equally,
/// merging when trimming would undercut the minimum mode length
///
fn resolve_conflicts(
    mut modes: Vec<Range<usize>>,
    min_length: usize,
    min_distance: usize,
) -> Vec<Range<usize>> {
    modes.sort_by_key(|mode| mode.start);
    let mut resolved: Vec<Range<usize>> = Vec::with_capacity(modes.len());
    for mode in modes {
        let Some(last) = resolved.last_mut() else {
            resolved.push(mode);
            continue;
        };
        let gap = mode.start.saturating_sub(last.end);
        if gap >= min_distance {
            resolved.push(mode);
            continue;
        }
        let needed = min_distance - gap;
        let trim_each = needed.div_ceil(2);
        if last.len() > trim_each + min_length && mode.len() > trim_each + min_length {
            last.end -= trim_each;
            resolved.push(mode.start + trim_each..mode.end);
        } else {
            last.end = mode.end.max(last.end);
        }
    }
    resolved
}

/// Find summit sub-ranges of one candidate from its raw per-bin signal
///
/// `strict_mask` marks the bins passing the secondary summit threshold; a
/// mode must contain at least one such bin to survive. Ranges are relative
/// to the candidate start. An empty result means the candidate has no
/// detectable summit and is kept whole by the caller.
///
pub fn find_summits(
    signal: &[f64],
    strict_mask: &[bool],
    bandwidth: usize,
) -> Vec<Range<usize>> {
    assert_eq!(signal.len(), strict_mask.len());
    if signal.is_empty() {
        return Vec::new();
    }
    let kernel = gaussian_kernel(bandwidth);
    let smoothed = smooth(signal, &kernel);

    let min_length = MIN_MODE_LENGTH_FACTOR * bandwidth;
    let min_distance = MIN_MODE_DISTANCE_FACTOR * bandwidth;

    let modes = local_maxima(&smoothed)
        .into_iter()
        .map(|peak| expand_mode(&smoothed, peak))
        .map(|mode| enforce_min_length(mode, min_length, signal.len()))
        .collect::<Vec<_>>();
    let mut modes = resolve_conflicts(modes, min_length, min_distance);

    modes.retain(|mode| strict_mask[mode.clone()].iter().any(|bit| *bit));
    modes
}
