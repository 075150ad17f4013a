//! The peak calling pipeline: coverage in, ranked peaks out
//!

use std::sync::mpsc::channel;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::candidates::{
    build_candidates, estimate_gap, is_unplaced_contig, Candidate,
};
use crate::chrom_list::{BinIndex, ChromList};
use crate::clipping::{clip_peak, max_clipped_density, DEFAULT_CLIP};
use crate::coverage::{score_base_range, zero_coverage_chroms, GenomeBins};
use crate::dip_test::dip_test;
use crate::error::{CancelToken, OmnipeakError, OmnipeakResult};
use crate::genome_regions::GenomeRegions;
use crate::hmm::{fit_hmm, FitConfig, FitResult, StateModel};
use crate::int_range::IntRange;
use crate::multiple_testing::{correct, Correction};
use crate::peaks::{sort_and_name_peaks, Peak};
use crate::scoring::{
    peak_value, score_chromosome_candidates, signal_noise_density, ScoredCandidate,
};
use crate::sensitivity::estimate_sensitivity;
use crate::stats_util::LogFactorialTable;
use crate::summits::{find_summits, DEFAULT_SUMMIT_BANDWIDTH};

/// Bins sampled for the posterior separability diagnostic
const DIP_SAMPLE_SIZE: usize = 2000;
const DIP_BOOTSTRAPS: usize = 200;
const DIP_SEED: u64 = 0;

/// Tunable constants of one analyze run, immutable once constructed
///
#[derive(Clone, Debug)]
pub struct AnalyzeConfig {
    pub bin_size: u32,
    pub fdr: f64,
    /// Caller-supplied log-PEP threshold, skipping the estimator
    pub sensitivity: Option<f64>,
    /// Caller-supplied merge gap, skipping the fragmentation estimator
    pub gap: Option<usize>,
    pub summits: bool,
    pub summit_bandwidth: usize,
    /// Weight of the signal excess in the clip ceiling; zero disables
    pub clip: f64,
    pub correction: Correction,
    pub fit: FitConfig,
    pub peak_name_prefix: String,
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        Self {
            bin_size: 100,
            fdr: 0.05,
            sensitivity: None,
            gap: None,
            summits: false,
            summit_bandwidth: DEFAULT_SUMMIT_BANDWIDTH,
            clip: DEFAULT_CLIP,
            correction: Correction::BenjaminiHochberg,
            fit: FitConfig::default(),
            peak_name_prefix: "peak".to_string(),
        }
    }
}

/// Prepared engine input for one experiment
///
pub struct EngineInput {
    pub chrom_list: ChromList,
    /// Per-dimension control-normalized counts the model is fitted on
    pub fit_bins: Vec<GenomeBins>,
    /// Raw treatment counts summed across dimensions, for scoring
    pub signal: GenomeBins,
    /// Control counts rescaled to the treatment scale, summed across
    /// dimensions, when any control file was supplied
    pub control: Option<Vec<Vec<f64>>>,
    pub blacklist: Option<GenomeRegions>,
}

/// Summary counters of one analyze run
///
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RunStats {
    pub chromosome_count: usize,
    pub excluded_chromosome_count: usize,
    pub candidate_count: usize,
    pub blacklisted_candidate_count: usize,
    pub peak_count: usize,
    pub sensitivity_threshold: f64,
    pub sensitivity_fallback: bool,
    pub merge_gap: usize,
    pub fit_iterations: usize,
    pub fit_converged: bool,
    pub fit_low_quality: bool,
    pub fit_out_of_snr_range: bool,
    pub signal_density: Option<f64>,
    pub noise_density: Option<f64>,
}

pub struct AnalyzeOutcome {
    pub peaks: Vec<Peak>,
    pub fit: FitResult,
    pub stats: RunStats,
}

/// Chromosomes taking part in candidate generation
///
/// Unplaced contigs and chromosomes without any treatment coverage are
/// excluded; the rest proceed.
///
fn included_chromosomes(chrom_list: &ChromList, fit_bins: &[GenomeBins]) -> Vec<bool> {
    let mut included = vec![true; chrom_list.chrom_count()];
    for (chrom_index, info) in chrom_list.data.iter().enumerate() {
        if is_unplaced_contig(&info.label) {
            included[chrom_index] = false;
        }
    }
    for chrom_index in zero_coverage_chroms(fit_bins) {
        if included[chrom_index] {
            info!(
                "Chromosome '{}' has no treatment coverage and is excluded",
                chrom_list.data[chrom_index].label
            );
            included[chrom_index] = false;
        }
    }
    included
}

/// Warn when the fitted posteriors show no separable signal mode
///
fn check_posterior_separability(log_null: &[Vec<f32>]) {
    let total: usize = log_null.iter().map(|chrom| chrom.len()).sum();
    if total < 8 {
        return;
    }
    let stride = (total / DIP_SAMPLE_SIZE).max(1);
    let sample = log_null
        .iter()
        .flatten()
        .step_by(stride)
        .map(|v| *v as f64)
        .collect::<Vec<_>>();
    let result = dip_test(&sample, DIP_BOOTSTRAPS, DIP_SEED);
    if result.p_value > 0.05 {
        warn!(
            "Log null posteriors show no separable signal mode (dip test p = {:.3}); \
             peak calls may be unreliable",
            result.p_value
        );
    }
}

/// Expand candidates into their summit sub-ranges
///
fn refine_candidate_summits(
    candidates: Vec<Candidate>,
    signal: &[u32],
    log_null: &[f32],
    summit_threshold: f64,
    bandwidth: usize,
) -> Vec<Candidate> {
    let mut refined = Vec::with_capacity(candidates.len());
    for mut candidate in candidates {
        let start = candidate.bins.start as usize;
        let end = candidate.bins.end as usize;
        let values = signal[start..end]
            .iter()
            .map(|v| *v as f64)
            .collect::<Vec<_>>();
        let strict_mask = log_null[start..end]
            .iter()
            .map(|v| (*v as f64) <= summit_threshold)
            .collect::<Vec<_>>();

        let summits = find_summits(&values, &strict_mask, bandwidth);
        if summits.is_empty() {
            refined.push(candidate);
            continue;
        }
        candidate.summits = Some(
            summits
                .iter()
                .map(|summit| {
                    IntRange::from_pair(
                        (start + summit.start) as i64,
                        (start + summit.end) as i64,
                    )
                })
                .collect(),
        );
        for summit in candidate.summits.as_ref().unwrap() {
            debug_assert!(candidate.bins.contains_range(summit));
            refined.push(Candidate {
                chrom_index: candidate.chrom_index,
                bins: summit.clone(),
                summits: None,
            });
        }
    }
    refined
}

/// Run the analyze pipeline on a fitted model
///
pub fn call_peaks_from_fit(
    input: &EngineInput,
    fit: &FitResult,
    config: &AnalyzeConfig,
    cancel: &CancelToken,
) -> OmnipeakResult<(Vec<Peak>, RunStats)> {
    let chrom_list = &input.chrom_list;
    let chrom_count = chrom_list.chrom_count();
    let bin_size = config.bin_size;

    // The fit's posteriors must partition the genome exactly as the layout
    // prescribes; a stored fit from another genome fails here
    let bin_index = BinIndex::new(chrom_list, bin_size);
    if fit.log_null.len() != chrom_count {
        return Err(OmnipeakError::Input(format!(
            "fit posteriors hold {} chromosome(s), expected {}",
            fit.log_null.len(),
            chrom_count
        )));
    }
    for chrom_index in 0..chrom_count {
        if fit.log_null[chrom_index].len() != bin_index.bin_count(chrom_index) {
            return Err(OmnipeakError::Input(format!(
                "fit posteriors for '{}' hold {} bins, expected {}",
                chrom_list.data[chrom_index].label,
                fit.log_null[chrom_index].len(),
                bin_index.bin_count(chrom_index)
            )));
        }
    }
    info!(
        "Peak calling over {} bins in {} chromosome(s)",
        bin_index.total_bins(),
        chrom_count
    );

    let mut stats = RunStats {
        chromosome_count: chrom_count,
        fit_iterations: fit.iterations,
        fit_converged: fit.converged,
        fit_low_quality: fit.parameters.flags.low_quality,
        fit_out_of_snr_range: fit.parameters.flags.out_of_snr_range,
        ..RunStats::default()
    };

    let included = included_chromosomes(chrom_list, &input.fit_bins);
    stats.excluded_chromosome_count = included.iter().filter(|inc| !**inc).count();

    check_posterior_separability(&fit.log_null);

    // Sensitivity: the included chromosomes' posteriors drive the sweep
    let masked_log_null = (0..chrom_count)
        .map(|chrom_index| {
            if included[chrom_index] {
                fit.log_null[chrom_index].clone()
            } else {
                Vec::new()
            }
        })
        .collect::<Vec<_>>();

    let (threshold, summit_threshold, fallback) = match config.sensitivity {
        Some(threshold) => (threshold, None, false),
        None => {
            let result = estimate_sensitivity(&masked_log_null, config.fdr, cancel)?;
            (result.threshold, result.summit_threshold, result.fallback)
        }
    };
    stats.sensitivity_threshold = threshold;
    stats.sensitivity_fallback = fallback;

    let masks = masked_log_null
        .iter()
        .map(|chrom| {
            chrom
                .iter()
                .map(|v| (*v as f64) <= threshold)
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let gap = match (config.gap, config.summits) {
        (Some(gap), _) => gap,
        (None, true) => 0,
        (None, false) => estimate_gap(&masks, bin_size),
    };
    stats.merge_gap = gap;

    // Candidate generation, summit refinement and blacklist filtering
    cancel.checkpoint()?;
    let mut chrom_candidates = Vec::with_capacity(chrom_count);
    for chrom_index in 0..chrom_count {
        let mut candidates = build_candidates(chrom_index, &masks[chrom_index], gap);
        if config.summits {
            let strict = summit_threshold.unwrap_or(threshold);
            candidates = refine_candidate_summits(
                candidates,
                &input.signal[chrom_index],
                &fit.log_null[chrom_index],
                strict,
                config.summit_bandwidth,
            );
        }
        if let Some(blacklist) = input.blacklist.as_ref() {
            let label = &chrom_list.data[chrom_index].label;
            let before = candidates.len();
            candidates.retain(|candidate| {
                !blacklist.intersect(
                    label,
                    candidate.bins.start * bin_size as i64,
                    candidate.bins.end * bin_size as i64,
                )
            });
            stats.blacklisted_candidate_count += before - candidates.len();
        }
        chrom_candidates.push(candidates);
    }
    stats.candidate_count = chrom_candidates.iter().map(|c| c.len()).sum();

    let density = signal_noise_density(&input.signal, &chrom_candidates);
    stats.signal_density = density.map(|d| d.signal);
    stats.noise_density = density.map(|d| d.noise);
    let noise_density = density.map(|d| d.noise);

    // Per-chromosome candidate scoring
    cancel.checkpoint()?;
    let table = LogFactorialTable::default();
    let scored: Vec<Vec<ScoredCandidate>> = {
        let (tx, rx) = channel();
        let table = &table;
        let input_ref = &*input;
        rayon::scope(|scope| {
            for (chrom_index, candidates) in chrom_candidates.into_iter().enumerate() {
                let tx = tx.clone();
                scope.spawn(move |_| {
                    let control = input_ref
                        .control
                        .as_ref()
                        .map(|control| control[chrom_index].as_slice());
                    let result = score_chromosome_candidates(
                        candidates,
                        &fit.log_null[chrom_index],
                        &input_ref.signal[chrom_index],
                        control,
                        noise_density,
                        table,
                    );
                    tx.send((chrom_index, result)).unwrap();
                });
            }
        });
        drop(tx);

        let mut scored = (0..chrom_count).map(|_| Vec::new()).collect::<Vec<_>>();
        for (chrom_index, chrom_scored) in rx {
            scored[chrom_index] = chrom_scored;
        }
        scored
    };
    cancel.checkpoint()?;

    // Global multiple-testing correction in a fixed chromosome order
    let log_ps = scored
        .iter()
        .flatten()
        .map(|candidate| candidate.log_p)
        .collect::<Vec<_>>();
    let log_qs = correct(&log_ps, config.correction);

    let ln_fdr = config.fdr.ln();
    let clip_ceiling = density.and_then(|d| {
        max_clipped_density(
            d.signal / bin_size as f64,
            d.noise / bin_size as f64,
            config.clip,
        )
    });

    let mut peaks = Vec::new();
    let mut flat_index = 0usize;
    for (chrom_index, chrom_scored) in scored.iter().enumerate() {
        let info = &chrom_list.data[chrom_index];
        for candidate in chrom_scored.iter() {
            let log_q = log_qs[flat_index];
            flat_index += 1;
            if candidate.log_p > ln_fdr || log_q > ln_fdr {
                continue;
            }

            let mut range = IntRange::from_pair(
                candidate.candidate.bins.start * bin_size as i64,
                (candidate.candidate.bins.end * bin_size as i64).min(info.length as i64),
            );
            if config.clip > 0.0 {
                if let Some(ceiling) = clip_ceiling {
                    let signal_bins = &input.signal[chrom_index];
                    range = clip_peak(&range, bin_size, ceiling, |sliver| {
                        score_base_range(signal_bins, bin_size, sliver)
                    });
                }
            }

            let minus_log10_q = -log_q / std::f64::consts::LN_10;
            peaks.push(Peak {
                chrom: info.label.clone(),
                start: range.start as u64,
                end: range.end as u64,
                name: String::new(),
                score: Peak::display_score(minus_log10_q),
                value: peak_value(candidate, noise_density),
                minus_log10_p: -candidate.log_p / std::f64::consts::LN_10,
                minus_log10_q,
            });
        }
    }
    sort_and_name_peaks(&mut peaks, &config.peak_name_prefix);
    stats.peak_count = peaks.len();

    info!(
        "Called {} peak(s) from {} candidate(s) at FDR {}",
        stats.peak_count, stats.candidate_count, config.fdr
    );
    Ok((peaks, stats))
}

/// Fit the model and run the full analyze pipeline
///
pub fn call_peaks(
    input: &EngineInput,
    config: &AnalyzeConfig,
    cancel: &CancelToken,
) -> OmnipeakResult<AnalyzeOutcome> {
    let fit = fit_hmm(StateModel::Analyze, &input.fit_bins, &config.fit, cancel)?;
    let (peaks, stats) = call_peaks_from_fit(input, &fit, config, cancel)?;
    Ok(AnalyzeOutcome { peaks, fit, stats })
}
