//! Peak boundary clipping by local signal density
//!

use crate::int_range::IntRange;

/// Shrink step sizes tried from each peak side, as fractions of one bin
const CLIP_STEP_FRACTIONS: [f64; 13] = [
    0.05, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.8, 1.0, 1.5, 2.0, 5.0, 10.0,
];

/// At most this fraction of the original peak length may be clipped per side
const MAX_CLIP_PER_SIDE: f64 = 0.4;

/// Default weight of the signal excess in the clipped density ceiling
pub const DEFAULT_CLIP: f64 = 0.4;

/// Clip low-density flanks off a peak
///
/// From each side independently, shrink steps drawn from a fixed fraction
/// list are attempted largest first; a step is accepted when the discarded
/// sliver's per-base density stays below `max_clipped_density` and the
/// cumulative clip remains within 40% of the original length.
///
/// `score` returns the signal count over a base range.
///
pub fn clip_peak(
    range: &IntRange,
    bin_size: u32,
    max_clipped_density: f64,
    score: impl Fn(&IntRange) -> f64,
) -> IntRange {
    let original_len = range.size();
    let max_side_clip = (original_len as f64 * MAX_CLIP_PER_SIDE) as i64;
    let mut clipped = range.clone();

    let mut left_clipped = 0i64;
    for fraction in CLIP_STEP_FRACTIONS.iter().rev() {
        let step = (fraction * bin_size as f64).round() as i64;
        if step == 0 || left_clipped + step > max_side_clip {
            continue;
        }
        let sliver = IntRange::from_pair(clipped.start, clipped.start + step);
        if score(&sliver) / (step as f64) < max_clipped_density {
            clipped.start += step;
            left_clipped += step;
        }
    }

    let mut right_clipped = 0i64;
    for fraction in CLIP_STEP_FRACTIONS.iter().rev() {
        let step = (fraction * bin_size as f64).round() as i64;
        if step == 0 || right_clipped + step > max_side_clip {
            continue;
        }
        let sliver = IntRange::from_pair(clipped.end - step, clipped.end);
        if score(&sliver) / (step as f64) < max_clipped_density {
            clipped.end -= step;
            right_clipped += step;
        }
    }

    clipped
}

/// The density ceiling below which flank slivers are discarded
///
/// Defined only when the candidate signal density exceeds the background
/// noise density.
///
pub fn max_clipped_density(signal: f64, noise: f64, clip: f64) -> Option<f64> {
    if signal > noise {
        Some(noise + clip * (signal - noise))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Per-base step signal: low flanks around a dense core
    fn step_signal(core: IntRange) -> impl Fn(&IntRange) -> f64 {
        move |range: &IntRange| {
            let mut total = 0.0;
            for pos in range.start..range.end {
                total += if core.intersect_pos(pos) { 10.0 } else { 0.5 };
            }
            total
        }
    }

    #[test]
    fn test_clip_trims_low_density_flanks() {
        let score = step_signal(IntRange::from_pair(1000, 2000));
        let peak = IntRange::from_pair(600, 2400);
        let clipped = clip_peak(&peak, 100, 2.0, score);
        assert_eq!(clipped, IntRange::from_pair(1000, 2000));
    }

    #[test]
    fn test_clip_respects_per_side_bound() {
        // A peak of uniform low density shrinks by at most 40% per side
        let score = |range: &IntRange| range.size() as f64 * 0.1;
        let peak = IntRange::from_pair(0, 1000);
        let clipped = clip_peak(&peak, 100, 5.0, score);
        assert!(clipped.start <= 400);
        assert!(clipped.end >= 600);
        assert!(clipped.start < clipped.end);
    }

    #[test]
    fn test_clip_keeps_dense_peak_intact() {
        let score = |range: &IntRange| range.size() as f64 * 20.0;
        let peak = IntRange::from_pair(500, 1500);
        let clipped = clip_peak(&peak, 100, 4.0, score);
        assert_eq!(clipped, peak);
    }

    #[test]
    fn test_max_clipped_density() {
        let ceiling = max_clipped_density(10.0, 2.0, 0.4).unwrap();
        approx::assert_abs_diff_eq!(ceiling, 2.0 + 0.4 * 8.0);
        assert!(max_clipped_density(2.0, 2.0, 0.4).is_none());
        assert!(max_clipped_density(1.0, 2.0, 0.4).is_none());
    }
}
