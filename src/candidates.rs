//! Candidate interval construction from per-bin foreground calls
//!

use std::ops::Range;

use log::{info, warn};

use crate::int_range::IntRange;

/// Span of gap sizes probed by the fragmentation estimator, in bases
const FRAGMENTATION_WINDOW_BASES: u32 = 5000;

/// Fragmentation compensation below this equivalent span keeps the gap at zero
const FRAGMENTATION_THRESHOLD_BASES: f64 = 500.0;

/// A candidate enriched interval in bin units
///
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub chrom_index: usize,
    pub bins: IntRange,
    /// Summit sub-ranges, disjoint and ordered, inside `bins`
    pub summits: Option<Vec<IntRange>>,
}

impl Candidate {
    pub fn new(chrom_index: usize, start_bin: usize, end_bin: usize) -> Self {
        Self {
            chrom_index,
            bins: IntRange::from_pair(start_bin as i64, end_bin as i64),
            summits: None,
        }
    }
}

/// Aggregate true bits into maximal runs, merging runs separated by at most
/// `gap` false bits
///
/// The aggregation is deterministic and total: every true bit belongs to
/// exactly one output range.
///
pub fn aggregate_bins(mask: &[bool], gap: usize) -> Vec<Range<usize>> {
    let mut runs: Vec<Range<usize>> = Vec::new();
    let mut open: Option<Range<usize>> = None;

    for (index, bit) in mask.iter().enumerate() {
        if !*bit {
            continue;
        }
        open = Some(match open {
            Some(run) if index - run.end <= gap => run.start..index + 1,
            Some(run) => {
                runs.push(run);
                index..index + 1
            }
            None => index..index + 1,
        });
    }
    if let Some(run) = open {
        runs.push(run);
    }
    runs
}

/// Count runs and their total bin length without materializing them
///
pub fn count_runs(mask: &[bool], gap: usize) -> (usize, usize) {
    let mut count = 0usize;
    let mut total_len = 0usize;
    let mut open: Option<Range<usize>> = None;

    for (index, bit) in mask.iter().enumerate() {
        if !*bit {
            continue;
        }
        open = Some(match open {
            Some(run) if index - run.end <= gap => run.start..index + 1,
            Some(run) => {
                count += 1;
                total_len += run.len();
                index..index + 1
            }
            None => index..index + 1,
        });
    }
    if let Some(run) = open {
        count += 1;
        total_len += run.len();
    }
    (count, total_len)
}

/// Return true for chromosome names that denote unplaced contigs
///
/// These are excluded from candidate generation.
///
pub fn is_unplaced_contig(name: &str) -> bool {
    if name.contains('_') {
        return true;
    }
    let lower = name.to_lowercase();
    lower.contains("random") || lower.contains("un")
}

/// Fragmentation-compensation gap from a candidate-count-by-gap curve
///
/// The area above the normalized fragmentation curve measures how fast
/// candidates fuse as the merge gap grows; once it exceeds the threshold
/// span, the remainder becomes the compensation gap.
///
pub fn gap_from_counts(counts: &[usize], bin_size: u32) -> usize {
    if counts.is_empty() || counts[0] == 0 {
        warn!("Fragmentation not detectable: no candidates at zero gap");
        return 0;
    }
    let base = counts[0] as f64;
    let normalized_sum: f64 = counts.iter().map(|c| *c as f64 / base).sum();
    let score = counts.len() as f64 - normalized_sum;
    let threshold = FRAGMENTATION_THRESHOLD_BASES / bin_size as f64;
    if score < threshold {
        0
    } else {
        (score - threshold).floor() as usize
    }
}

/// Estimate the merge gap from per-chromosome foreground masks
///
pub fn estimate_gap(masks: &[Vec<bool>], bin_size: u32) -> usize {
    let probe_count = FRAGMENTATION_WINDOW_BASES.div_ceil(bin_size) as usize;
    let counts = (0..probe_count)
        .map(|gap| {
            masks
                .iter()
                .map(|mask| count_runs(mask, gap).0)
                .sum::<usize>()
        })
        .collect::<Vec<_>>();
    let gap = gap_from_counts(&counts, bin_size);
    info!("Fragmentation compensation gap: {gap} bin(s)");
    gap
}

/// Build the candidate list of one chromosome at a fixed gap
///
pub fn build_candidates(chrom_index: usize, mask: &[bool], gap: usize) -> Vec<Candidate> {
    aggregate_bins(mask, gap)
        .into_iter()
        .map(|run| Candidate::new(chrom_index, run.start, run.end))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask_from(bits: &[u8]) -> Vec<bool> {
        bits.iter().map(|b| *b != 0).collect()
    }

    #[test]
    fn test_aggregate_bins_no_gap() {
        let mask = mask_from(&[0, 1, 1, 0, 0, 1, 0, 1, 1, 1]);
        assert_eq!(aggregate_bins(&mask, 0), vec![1..3, 5..6, 7..10]);
        assert_eq!(aggregate_bins(&[], 0), Vec::<Range<usize>>::new());
    }

    #[test]
    fn test_aggregate_bins_with_gap() {
        let mask = mask_from(&[0, 1, 1, 0, 0, 1, 0, 1, 1, 1]);
        assert_eq!(aggregate_bins(&mask, 1), vec![1..3, 5..10]);
        assert_eq!(aggregate_bins(&mask, 2), vec![1..10]);
    }

    #[test]
    fn test_count_runs_matches_aggregation() {
        let mask = mask_from(&[1, 0, 1, 1, 0, 0, 0, 1, 1, 1, 0, 1]);
        for gap in 0..5 {
            let runs = aggregate_bins(&mask, gap);
            let (count, total_len) = count_runs(&mask, gap);
            assert_eq!(count, runs.len());
            assert_eq!(total_len, runs.iter().map(|r| r.len()).sum::<usize>());
        }
    }

    #[test]
    fn test_gap_monotonicity() {
        // Growing the gap can only reduce the candidate count, and every
        // wide-gap candidate is a union of adjacent narrow-gap candidates
        let mask = mask_from(&[1, 0, 1, 0, 0, 1, 1, 0, 0, 0, 1, 0, 1, 1]);
        let mut last_count = usize::MAX;
        for gap in 0..6 {
            let runs = aggregate_bins(&mask, gap);
            assert!(runs.len() <= last_count);
            last_count = runs.len();

            let narrow = aggregate_bins(&mask, 0);
            for run in runs.iter() {
                let members = narrow
                    .iter()
                    .filter(|n| n.start >= run.start && n.end <= run.end)
                    .collect::<Vec<_>>();
                assert!(!members.is_empty());
                assert_eq!(members.first().unwrap().start, run.start);
                assert_eq!(members.last().unwrap().end, run.end);
            }
        }
    }

    #[test]
    fn test_unplaced_contig_filter() {
        assert!(is_unplaced_contig("chrUn_gl000220"));
        assert!(is_unplaced_contig("chr1_gl000191_random"));
        assert!(is_unplaced_contig("chrUn"));
        assert!(!is_unplaced_contig("chr1"));
        assert!(!is_unplaced_contig("chrX"));
    }

    #[test]
    fn test_gap_from_counts_fragmented_track() {
        // Candidate count collapses quickly as the gap grows: compensation on
        let bin_size = 200;
        let mut counts = vec![1000, 500, 250, 200, 180];
        while counts.len() < 25 {
            counts.push(170);
        }
        assert!(gap_from_counts(&counts, bin_size) > 0);
    }

    #[test]
    fn test_gap_from_counts_non_fragmented_track() {
        // Count decreases by at most 1% per step: no compensation
        let bin_size = 200;
        let counts = (0..25)
            .map(|g| (1000.0 * 0.99f64.powi(g)).round() as usize)
            .collect::<Vec<_>>();
        assert_eq!(gap_from_counts(&counts, bin_size), 0);
    }

    #[test]
    fn test_gap_from_counts_empty() {
        assert_eq!(gap_from_counts(&[], 100), 0);
        assert_eq!(gap_from_counts(&[0, 0], 100), 0);
    }
}
