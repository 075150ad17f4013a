//! Candidate scoring: model posteriors combined with a Poisson signal tail
//!

use log::warn;

use crate::candidates::Candidate;
use crate::coverage::score_bin_range;
use crate::int_range::IntRange;
use crate::stats_util::{median, KahanSum, LogFactorialTable};

/// Maximum number of background bins separating bins of one score block
pub const BLOCK_GAP_BINS: usize = 3;

/// One scored candidate, ready for multiple-testing correction
///
#[derive(Clone, Debug)]
pub struct ScoredCandidate {
    pub candidate: Candidate,
    /// Combined log p-value of the candidate
    pub log_p: f64,
    /// Treatment count sum over the candidate
    pub score: f64,
    /// Scaled control count sum over the candidate, when control exists
    pub control_score: Option<f64>,
    /// Total model log p over the candidate's score blocks
    pub model_log_p: f64,
}

/// Global signal and noise bin densities over one experiment
///
#[derive(Clone, Copy, Debug)]
pub struct SignalNoiseDensity {
    /// Mean treatment count per bin inside candidates
    pub signal: f64,
    /// Mean treatment count per bin outside candidates
    pub noise: f64,
}

/// Compute genome-wide signal and noise densities from candidate masks
///
/// Returns None when there are no candidate or background bins to average.
///
pub fn signal_noise_density(
    signal: &[Vec<u32>],
    candidates: &[Vec<Candidate>],
) -> Option<SignalNoiseDensity> {
    let mut inside_sum = 0.0f64;
    let mut inside_bins = 0usize;
    let mut outside_sum = 0.0f64;
    let mut outside_bins = 0usize;

    for (chrom_bins, chrom_candidates) in signal.iter().zip(candidates.iter()) {
        let mut mask = vec![false; chrom_bins.len()];
        for candidate in chrom_candidates.iter() {
            for bit in mask[candidate.bins.start as usize..candidate.bins.end as usize]
                .iter_mut()
            {
                *bit = true;
            }
        }
        for (count, inside) in chrom_bins.iter().zip(mask.iter()) {
            if *inside {
                inside_sum += *count as f64;
                inside_bins += 1;
            } else {
                outside_sum += *count as f64;
                outside_bins += 1;
            }
        }
    }
    if inside_bins == 0 || outside_bins == 0 {
        return None;
    }
    let density = SignalNoiseDensity {
        signal: inside_sum / inside_bins as f64,
        noise: outside_sum / outside_bins as f64,
    };
    if density.signal <= density.noise {
        warn!(
            "Candidate signal density {:.4} is not above noise density {:.4}",
            density.signal, density.noise
        );
    }
    Some(density)
}

/// Decompose a candidate into score blocks
///
/// Blocks are the candidate bins at or below the candidate's median log
/// null, aggregated with a small intra-block gap. A candidate whose bins
/// defeat the decomposition is kept as one whole block.
///
fn score_blocks(candidate: &IntRange, log_null: &[f32]) -> Vec<IntRange> {
    debug_assert!(candidate.end as usize <= log_null.len());
    let start = candidate.start as usize;
    let end = candidate.end as usize;
    let values = log_null[start..end]
        .iter()
        .map(|v| *v as f64)
        .collect::<Vec<_>>();
    let cutoff = match median(&values) {
        Some(cutoff) => cutoff,
        None => return vec![candidate.clone()],
    };

    let mask = values.iter().map(|v| *v <= cutoff).collect::<Vec<_>>();
    let blocks = crate::candidates::aggregate_bins(&mask, BLOCK_GAP_BINS)
        .into_iter()
        .map(|run| {
            IntRange::from_pair((start + run.start) as i64, (start + run.end) as i64)
        })
        .collect::<Vec<_>>();
    if blocks.is_empty() {
        vec![candidate.clone()]
    } else {
        blocks
    }
}

/// Model log p of one block: the sum of its per-bin log null posteriors
///
fn block_model_log_p(block: &IntRange, log_null: &[f32]) -> f64 {
    log_null[block.start as usize..block.end as usize]
        .iter()
        .map(|v| *v as f64)
        .sum()
}

fn range_sum_f64(values: &[f64], range: &IntRange) -> f64 {
    values[range.start as usize..range.end as usize].iter().sum()
}

/// Combined log p of one block
///
/// The model posterior and the Poisson signal tail are both non-positive,
/// so their geometric combination is well-defined; with no usable lambda
/// the model term stands alone.
///
fn block_log_p(
    model_log_p: f64,
    score: f64,
    lambda: Option<f64>,
    table: &LogFactorialTable,
) -> f64 {
    match lambda {
        Some(lambda) => {
            let k = score.ceil() as u64 + 1;
            let signal_log_p = table.log_poisson_upper_tail(k, lambda);
            -(model_log_p * signal_log_p).sqrt()
        }
        None => model_log_p,
    }
}

/// Score all candidates of one chromosome
///
/// `control` carries per-bin control counts already rescaled to the
/// treatment scale. `noise_density` is the per-bin background density used
/// when no control is available.
///
pub fn score_chromosome_candidates(
    candidates: Vec<Candidate>,
    log_null: &[f32],
    signal: &[u32],
    control: Option<&[f64]>,
    noise_density: Option<f64>,
    table: &LogFactorialTable,
) -> Vec<ScoredCandidate> {
    candidates
        .into_iter()
        .map(|candidate| {
            let blocks = score_blocks(&candidate.bins, log_null);

            // (log_p, length, score) per block, sorted by score for the
            // numerically stable weighted mean
            let mut block_stats = blocks
                .iter()
                .map(|block| {
                    let model_log_p = block_model_log_p(block, log_null);
                    let score = score_bin_range(signal, block) as f64;
                    let lambda = match control {
                        Some(control) => Some(range_sum_f64(control, block) + 1.0),
                        None => noise_density
                            .map(|density| density * block.size() as f64 + 1.0),
                    };
                    let log_p = block_log_p(model_log_p, score, lambda, table);
                    (log_p, block.size() as f64, score, model_log_p)
                })
                .collect::<Vec<_>>();
            block_stats.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap());

            let mut weighted = KahanSum::default();
            let mut total_len = 0.0f64;
            let mut model_log_p = 0.0f64;
            for (log_p, len, _, block_model) in block_stats.iter() {
                weighted.add(log_p * len);
                total_len += len;
                model_log_p += block_model;
            }
            let log_p = (weighted.sum() / total_len).min(0.0);

            let score = score_bin_range(signal, &candidate.bins) as f64;
            let control_score =
                control.map(|control| range_sum_f64(control, &candidate.bins));

            ScoredCandidate {
                candidate,
                log_p,
                score,
                control_score,
                model_log_p,
            }
        })
        .collect()
}

/// The peak value field
///
/// Fold enrichment against control when available, against the background
/// density otherwise, and the model log p magnitude as a last resort.
///
pub fn peak_value(scored: &ScoredCandidate, noise_density: Option<f64>) -> f64 {
    let enriched = scored.score.ceil() + 1.0;
    if let Some(control_score) = scored.control_score {
        return enriched / (control_score + 1.0);
    }
    if let Some(noise) = noise_density {
        let length = scored.candidate.bins.size() as f64;
        return enriched / (noise * length + 1.0);
    }
    -scored.model_log_p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> LogFactorialTable {
        LogFactorialTable::default()
    }

    #[test]
    fn test_score_blocks_median_split() {
        // The most enriched half of the candidate forms the block
        let log_null: Vec<f32> = vec![-0.1, -0.1, -9.0, -9.0, -9.0, -9.0, -0.1, -0.1];
        let candidate = IntRange::from_pair(0, 8);
        let blocks = score_blocks(&candidate, &log_null);
        assert_eq!(blocks, vec![IntRange::from_pair(2, 6)]);
    }

    #[test]
    fn test_score_blocks_gap_aggregation() {
        // Strong bins separated by small gaps merge into one block
        let log_null: Vec<f32> = vec![
            -9.0, -9.0, -0.1, -0.1, -9.0, -9.0, -0.1, -0.1, -9.0, -9.0, -0.1, -0.1,
        ];
        let candidate = IntRange::from_pair(0, 12);
        let blocks = score_blocks(&candidate, &log_null);
        assert_eq!(blocks, vec![IntRange::from_pair(0, 10)]);
    }

    #[test]
    fn test_whole_chromosome_candidate_single_block() {
        // A candidate spanning everything with uniform posteriors stays one
        // block covering the chromosome
        let log_null: Vec<f32> = vec![-5.0; 12];
        let candidate = IntRange::from_pair(0, 12);
        let blocks = score_blocks(&candidate, &log_null);
        assert_eq!(blocks, vec![IntRange::from_pair(0, 12)]);
    }

    #[test]
    fn test_block_log_p_combination() {
        let table = table();
        // Strong model and strong signal tails reinforce each other
        let combined = block_log_p(-50.0, 100.0, Some(2.0), &table);
        assert!(combined < -50.0);
        assert!(combined.is_finite());
        // Without lambda the model term stands alone
        assert_eq!(block_log_p(-50.0, 100.0, None, &table), -50.0);
        // Weak signal dampens a strong model p
        let damped = block_log_p(-50.0, 2.0, Some(10.0), &table);
        assert!(damped > combined);
        assert!(damped <= 0.0);
    }

    #[test]
    fn test_score_chromosome_candidates_orders_by_strength() {
        let table = table();
        let mut log_null = vec![-0.01f32; 100];
        for v in log_null[10..20].iter_mut() {
            *v = -30.0;
        }
        for v in log_null[50..60].iter_mut() {
            *v = -5.0;
        }
        let mut signal = vec![1u32; 100];
        for v in signal[10..20].iter_mut() {
            *v = 50;
        }
        for v in signal[50..60].iter_mut() {
            *v = 8;
        }

        let candidates = vec![
            Candidate::new(0, 10, 20),
            Candidate::new(0, 50, 60),
        ];
        let scored = score_chromosome_candidates(
            candidates,
            &log_null,
            &signal,
            None,
            Some(1.0),
            &table,
        );
        assert_eq!(scored.len(), 2);
        assert!(scored[0].log_p < scored[1].log_p);
        assert!(scored[0].log_p < 0.0);
        assert_eq!(scored[0].score, 500.0);
        assert_eq!(scored[0].control_score, None);
    }

    #[test]
    fn test_signal_noise_density() {
        let signal = vec![vec![10u32, 10, 1, 1, 1, 1, 10, 10]];
        let candidates = vec![vec![
            Candidate::new(0, 0, 2),
            Candidate::new(0, 6, 8),
        ]];
        let density = signal_noise_density(&signal, &candidates).unwrap();
        approx::assert_abs_diff_eq!(density.signal, 10.0);
        approx::assert_abs_diff_eq!(density.noise, 1.0);

        // A candidate-free chromosome set has no signal density
        let empty: Vec<Vec<Candidate>> = vec![vec![]];
        assert!(signal_noise_density(&signal, &empty).is_none());
    }

    #[test]
    fn test_peak_value_fallbacks() {
        let scored = ScoredCandidate {
            candidate: Candidate::new(0, 0, 10),
            log_p: -20.0,
            score: 99.0,
            control_score: Some(9.0),
            model_log_p: -30.0,
        };
        approx::assert_abs_diff_eq!(peak_value(&scored, Some(1.0)), 10.0);

        let mut no_control = scored.clone();
        no_control.control_score = None;
        approx::assert_abs_diff_eq!(peak_value(&no_control, Some(1.0)), 100.0 / 11.0);
        approx::assert_abs_diff_eq!(peak_value(&no_control, None), 30.0);
    }
}
