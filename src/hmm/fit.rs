use std::sync::mpsc::channel;

use log::{debug, info, warn};
use strum::EnumCount;

use super::{HmmParameters, Level, NegBinEmission, StateModel};
use crate::error::{CancelToken, OmnipeakError, OmnipeakResult};
use crate::stats_util::{log_sum_exp, median};

/// Ceiling applied to per-bin log null posteriors
///
/// Posteriors extremely close to one would otherwise round to a log of zero
/// and break the logarithmic threshold sweeps downstream.
///
pub const LOG_NULL_CEILING: f64 = -1e-10;

/// Floor keeping per-bin log null posteriors finite in f32 storage
const LOG_NULL_FLOOR: f64 = -1e30;

/// How many bins each worker processes between cancellation checks
const CANCEL_CHECK_STRIDE: usize = 65_536;

#[derive(Clone, Debug)]
pub struct FitConfig {
    pub max_iterations: usize,
    pub convergence_threshold: f64,
    /// Fraction of the lowest nonzero bins used to initialize the Low mean
    pub low_init_fraction: f64,
    /// Fraction of the highest nonzero bins used to initialize the High mean
    pub high_init_fraction: f64,
    /// Minimum allowed High/Low mean ratio; clamped when EM drives it lower
    pub min_snr: f64,
    pub keep_state_posteriors: bool,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            convergence_threshold: 1e-4,
            low_init_fraction: 0.5,
            high_init_fraction: 0.1,
            min_snr: 1.1,
            keep_state_posteriors: false,
        }
    }
}

/// Result of fitting the HMM over all chromosomes of one experiment
///
pub struct FitResult {
    pub parameters: HmmParameters,
    pub log_likelihood: f64,
    pub iterations: usize,
    pub converged: bool,

    /// Per-chromosome per-bin log posterior of null-state membership
    pub log_null: Vec<Vec<f32>>,

    /// Per-chromosome per-state per-bin log posteriors, on request only
    pub state_posteriors: Option<Vec<Vec<Vec<f32>>>>,
}

/// Per-dimension binned counts over all chromosomes, `bins[chrom][bin]`
pub type GenomeBins = Vec<Vec<u32>>;

#[derive(Clone, Default)]
struct MomentAccumulator {
    weight: f64,
    weighted_sum: f64,
    weighted_square_sum: f64,
}

impl MomentAccumulator {
    fn add(&mut self, weight: f64, value: f64) {
        self.weight += weight;
        self.weighted_sum += weight * value;
        self.weighted_square_sum += weight * value * value;
    }

    fn merge(&mut self, other: &Self) {
        self.weight += other.weight;
        self.weighted_sum += other.weighted_sum;
        self.weighted_square_sum += other.weighted_square_sum;
    }

    fn mean(&self) -> f64 {
        self.weighted_sum / self.weight
    }

    fn variance(&self) -> f64 {
        let mean = self.mean();
        (self.weighted_square_sum / self.weight - mean * mean).max(0.0)
    }
}

struct EStepStats {
    log_likelihood: f64,
    prior_weights: Vec<f64>,
    transition_weights: Vec<Vec<f64>>,
    level_moments: Vec<[MomentAccumulator; 2]>,
}

impl EStepStats {
    fn new(state_count: usize, dim_count: usize) -> Self {
        Self {
            log_likelihood: 0.0,
            prior_weights: vec![0.0; state_count],
            transition_weights: vec![vec![0.0; state_count]; state_count],
            level_moments: vec![
                [MomentAccumulator::default(), MomentAccumulator::default()];
                dim_count
            ],
        }
    }

    fn merge(&mut self, other: &Self) {
        self.log_likelihood += other.log_likelihood;
        for (a, b) in self.prior_weights.iter_mut().zip(other.prior_weights.iter()) {
            *a += b;
        }
        for (row_a, row_b) in self
            .transition_weights
            .iter_mut()
            .zip(other.transition_weights.iter())
        {
            for (a, b) in row_a.iter_mut().zip(row_b.iter()) {
                *a += b;
            }
        }
        for (a, b) in self.level_moments.iter_mut().zip(other.level_moments.iter()) {
            a[0].merge(&b[0]);
            a[1].merge(&b[1]);
        }
    }
}

/// Per-(dimension, level) emission log-pmf lookup indexed by the count value
///
struct EmissionTables {
    tables: Vec<[Vec<f64>; 2]>,
}

impl EmissionTables {
    fn new(parameters: &HmmParameters, max_count: u32) -> Self {
        let tables = parameters
            .emissions
            .iter()
            .map(|levels| {
                [
                    (0..=max_count).map(|x| levels[0].ln_pmf(x)).collect(),
                    (0..=max_count).map(|x| levels[1].ln_pmf(x)).collect(),
                ]
            })
            .collect();
        Self { tables }
    }

    fn ln_pmf(&self, dim: usize, level: usize, x: u32) -> f64 {
        self.tables[dim][level][x as usize]
    }
}

/// Dense per-bin per-state log emission matrix for one chromosome
///
fn chromosome_emissions(
    parameters: &HmmParameters,
    tables: &EmissionTables,
    chrom_bins: &[&[u32]],
) -> Vec<f64> {
    let state_count = parameters.state_count();
    let dim_count = chrom_bins.len();
    let bin_count = chrom_bins[0].len();

    let mut emissions = vec![0.0f64; bin_count * state_count];
    for t in 0..bin_count {
        let row = &mut emissions[t * state_count..(t + 1) * state_count];
        let all_zero = chrom_bins.iter().all(|bins| bins[t] == 0);
        row[0] = if all_zero { 0.0 } else { f64::NEG_INFINITY };
        for state in 1..state_count {
            let mut ln_prob = 0.0;
            for dim in 0..dim_count {
                let level = parameters.model.emission_level(state, dim) as usize;
                ln_prob += tables.ln_pmf(dim, level, chrom_bins[dim][t]);
            }
            row[state] = ln_prob;
        }
    }
    emissions
}

/// Log-space forward and backward passes over one chromosome
///
/// Returns (alpha, beta, log_likelihood); both matrices are bin-major with
/// `state_count` columns.
///
fn forward_backward(
    parameters: &HmmParameters,
    emissions: &[f64],
) -> (Vec<f64>, Vec<f64>, f64) {
    let state_count = parameters.state_count();
    let bin_count = emissions.len() / state_count;
    assert!(bin_count > 0);

    let transitions = &parameters.log_transitions;
    let mut alpha = vec![f64::NEG_INFINITY; bin_count * state_count];
    let mut beta = vec![f64::NEG_INFINITY; bin_count * state_count];
    let mut scratch = vec![0.0f64; state_count];

    for k in 0..state_count {
        alpha[k] = parameters.log_priors[k] + emissions[k];
    }
    for t in 1..bin_count {
        let (prev, this) = alpha.split_at_mut(t * state_count);
        let prev = &prev[(t - 1) * state_count..];
        for k in 0..state_count {
            for (j, value) in scratch.iter_mut().enumerate() {
                *value = prev[j] + transitions[j][k];
            }
            this[k] = emissions[t * state_count + k] + log_sum_exp(&scratch);
        }
    }

    for k in 0..state_count {
        beta[(bin_count - 1) * state_count + k] = 0.0;
    }
    for t in (0..bin_count - 1).rev() {
        for k in 0..state_count {
            for (j, value) in scratch.iter_mut().enumerate() {
                *value = transitions[k][j]
                    + emissions[(t + 1) * state_count + j]
                    + beta[(t + 1) * state_count + j];
            }
            beta[t * state_count + k] = log_sum_exp(&scratch);
        }
    }

    let log_likelihood = log_sum_exp(&alpha[(bin_count - 1) * state_count..]);
    (alpha, beta, log_likelihood)
}

/// One chromosome's contribution to the Baum-Welch sufficient statistics
///
/// Returns None when cancellation was observed mid-pass.
///
fn chromosome_estep(
    parameters: &HmmParameters,
    tables: &EmissionTables,
    chrom_bins: &[&[u32]],
    cancel: &CancelToken,
) -> Option<EStepStats> {
    let state_count = parameters.state_count();
    let dim_count = chrom_bins.len();
    let bin_count = chrom_bins[0].len();
    let mut stats = EStepStats::new(state_count, dim_count);
    if bin_count == 0 {
        return Some(stats);
    }

    let emissions = chromosome_emissions(parameters, tables, chrom_bins);
    let (alpha, beta, log_likelihood) = forward_backward(parameters, &emissions);
    stats.log_likelihood = log_likelihood;

    for k in 0..state_count {
        stats.prior_weights[k] += (alpha[k] + beta[k] - log_likelihood).exp();
    }

    let transitions = &parameters.log_transitions;
    for t in 0..bin_count {
        if t % CANCEL_CHECK_STRIDE == 0 && cancel.is_cancelled() {
            return None;
        }

        // State posterior weighted emission moments
        for k in 1..state_count {
            let ln_gamma_tk = alpha[t * state_count + k] + beta[t * state_count + k]
                - log_likelihood;
            let weight = ln_gamma_tk.exp();
            if weight > 0.0 {
                for dim in 0..dim_count {
                    let level = parameters.model.emission_level(k, dim) as usize;
                    stats.level_moments[dim][level].add(weight, chrom_bins[dim][t] as f64);
                }
            }
        }

        // Pairwise state posteriors for the transition update
        if t + 1 < bin_count {
            for i in 0..state_count {
                let alpha_ti = alpha[t * state_count + i];
                if alpha_ti == f64::NEG_INFINITY {
                    continue;
                }
                for j in 0..state_count {
                    let ln_xi = alpha_ti
                        + transitions[i][j]
                        + emissions[(t + 1) * state_count + j]
                        + beta[(t + 1) * state_count + j]
                        - log_likelihood;
                    stats.transition_weights[i][j] += ln_xi.exp();
                }
            }
        }
    }

    Some(stats)
}

/// Run the parallel E-step over all chromosomes
///
fn parallel_estep(
    parameters: &HmmParameters,
    bins: &[GenomeBins],
    tables: &EmissionTables,
    cancel: &CancelToken,
) -> OmnipeakResult<EStepStats> {
    let chrom_count = bins[0].len();
    let (tx, rx) = channel();

    rayon::scope(|scope| {
        for chrom_index in 0..chrom_count {
            let tx = tx.clone();
            scope.spawn(move |_| {
                let chrom_bins = bins
                    .iter()
                    .map(|dim| dim[chrom_index].as_slice())
                    .collect::<Vec<_>>();
                let result = chromosome_estep(parameters, tables, &chrom_bins, cancel);
                tx.send(result).unwrap();
            });
        }
    });
    drop(tx);

    let mut stats = EStepStats::new(parameters.state_count(), parameters.dimension_count());
    for chrom_stats in rx {
        match chrom_stats {
            Some(chrom_stats) => stats.merge(&chrom_stats),
            None => return Err(OmnipeakError::Cancelled),
        }
    }
    Ok(stats)
}

/// Update parameters in place from accumulated sufficient statistics
///
fn mstep(parameters: &mut HmmParameters, stats: &EStepStats, min_snr: f64) {
    let state_count = parameters.state_count();

    let prior_total: f64 = stats.prior_weights.iter().sum();
    if prior_total > 0.0 {
        for k in 0..state_count {
            parameters.log_priors[k] = (stats.prior_weights[k] / prior_total)
                .max(f64::MIN_POSITIVE)
                .ln();
        }
    }

    for i in 0..state_count {
        let row_total: f64 = stats.transition_weights[i].iter().sum();
        if row_total > 0.0 {
            for j in 0..state_count {
                parameters.log_transitions[i][j] = (stats.transition_weights[i][j] / row_total)
                    .max(f64::MIN_POSITIVE)
                    .ln();
            }
        }
    }

    for (dim, moments) in stats.level_moments.iter().enumerate() {
        for level in 0..Level::COUNT {
            if moments[level].weight > 0.0 {
                parameters.emissions[dim][level]
                    .set_moments(moments[level].mean(), moments[level].variance());
            }
        }
    }
    enforce_snr(parameters, min_snr);
}

/// Keep the High mean at or above `min_snr` times the Low mean
///
fn enforce_snr(parameters: &mut HmmParameters, min_snr: f64) {
    for dim in 0..parameters.dimension_count() {
        let low_mean = parameters.emissions[dim][0].mean;
        let high = &mut parameters.emissions[dim][1];
        if low_mean > 0.0 && high.mean < low_mean * min_snr {
            *high = NegBinEmission::new(low_mean * min_snr, high.failures);
            if !parameters.flags.out_of_snr_range {
                warn!(
                    "High state mean clamped to {:.4} on dimension {}: fit is out of the \
                     configured signal-to-noise range",
                    low_mean * min_snr,
                    dim
                );
            }
            parameters.flags.out_of_snr_range = true;
        }
    }
}

/// Initialize Low/High emissions per dimension from the nonzero count spectrum
///
fn initialize_emissions(
    bins: &[GenomeBins],
    config: &FitConfig,
) -> OmnipeakResult<Vec<[NegBinEmission; 2]>> {
    let mut emissions = Vec::with_capacity(bins.len());
    for dim_bins in bins.iter() {
        let mut nonzero = dim_bins
            .iter()
            .flatten()
            .filter(|x| **x > 0)
            .map(|x| *x as f64)
            .collect::<Vec<_>>();
        if nonzero.is_empty() {
            return Err(OmnipeakError::Input(
                "model can't be trained on empty coverage".to_string(),
            ));
        }
        nonzero.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let low_len = ((nonzero.len() as f64 * config.low_init_fraction) as usize).max(1);
        let high_len = ((nonzero.len() as f64 * config.high_init_fraction) as usize).max(1);
        let low_slice = &nonzero[..low_len];
        let high_slice = &nonzero[nonzero.len() - high_len..];

        let low = tier_emission(low_slice);
        let mut high = tier_emission(high_slice);
        if high.mean < low.mean * config.min_snr {
            high = NegBinEmission::new(low.mean * config.min_snr, high.failures);
        }
        emissions.push([low, high]);
    }
    Ok(emissions)
}

fn tier_emission(values: &[f64]) -> NegBinEmission {
    let mean = median(values).unwrap();
    let spread: f64 =
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    NegBinEmission::from_moments(mean, spread)
}

/// Final posterior pass for one chromosome
///
fn chromosome_posteriors(
    parameters: &HmmParameters,
    tables: &EmissionTables,
    chrom_bins: &[&[u32]],
    keep_state_posteriors: bool,
) -> (Vec<f32>, Option<Vec<Vec<f32>>>) {
    let state_count = parameters.state_count();
    let bin_count = chrom_bins[0].len();
    if bin_count == 0 {
        return (Vec::new(), keep_state_posteriors.then(Vec::new));
    }

    let emissions = chromosome_emissions(parameters, tables, chrom_bins);
    let (alpha, beta, log_likelihood) = forward_backward(parameters, &emissions);

    let null_states = parameters.model.null_states();
    let mut log_null = Vec::with_capacity(bin_count);
    let mut state_posteriors =
        keep_state_posteriors.then(|| vec![Vec::with_capacity(bin_count); state_count]);
    let mut scratch = vec![0.0f64; null_states.len()];

    for t in 0..bin_count {
        for (slot, k) in scratch.iter_mut().zip(null_states.iter()) {
            *slot = alpha[t * state_count + *k] + beta[t * state_count + *k] - log_likelihood;
        }
        let value = log_sum_exp(&scratch)
            .clamp(LOG_NULL_FLOOR, LOG_NULL_CEILING);
        log_null.push(value as f32);

        if let Some(posteriors) = state_posteriors.as_mut() {
            for (k, row) in posteriors.iter_mut().enumerate() {
                let ln_gamma = alpha[t * state_count + k] + beta[t * state_count + k]
                    - log_likelihood;
                row.push(ln_gamma.clamp(LOG_NULL_FLOOR, 0.0) as f32);
            }
        }
    }
    (log_null, state_posteriors)
}

/// Fit the zero-inflated negative-binomial HMM by Baum-Welch EM
///
/// `bins[dim][chrom][bin]` are the binned counts of each track dimension.
/// Work is partitioned at chromosome granularity within the current rayon
/// pool; the fit is deterministic given the input and configuration.
///
pub fn fit_hmm(
    model: StateModel,
    bins: &[GenomeBins],
    config: &FitConfig,
    cancel: &CancelToken,
) -> OmnipeakResult<FitResult> {
    assert!(!bins.is_empty());
    let chrom_count = bins[0].len();
    assert!(bins.iter().all(|dim| dim.len() == chrom_count));

    let emissions = initialize_emissions(bins, config)?;
    let mut parameters = HmmParameters::new(model, emissions);
    let max_count = bins
        .iter()
        .flatten()
        .flatten()
        .copied()
        .max()
        .unwrap_or(0);

    info!(
        "Training {} state HMM over {} dimension(s), {} chromosome(s)",
        parameters.state_count(),
        parameters.dimension_count(),
        chrom_count
    );

    let mut log_likelihood = f64::NEG_INFINITY;
    let mut converged = false;
    let mut iterations = 0;
    for iteration in 0..config.max_iterations {
        cancel.checkpoint()?;
        let tables = EmissionTables::new(&parameters, max_count);
        let stats = parallel_estep(&parameters, bins, &tables, cancel)?;
        iterations = iteration + 1;

        debug!(
            "EM iteration {}: log likelihood {:.4}",
            iterations, stats.log_likelihood
        );

        let relative_change = if log_likelihood == f64::NEG_INFINITY {
            f64::INFINITY
        } else {
            (stats.log_likelihood - log_likelihood).abs() / log_likelihood.abs().max(1.0)
        };
        log_likelihood = stats.log_likelihood;

        mstep(&mut parameters, &stats, config.min_snr);

        if relative_change <= config.convergence_threshold {
            converged = true;
            break;
        }
    }
    if !converged {
        warn!(
            "EM did not converge after {} iterations, keeping the last iterate",
            iterations
        );
    }

    if parameters.order_states() {
        info!("States exchanged to restore the Low <= High mean ordering");
    } else if parameters.flags.low_quality {
        warn!("Mean and success-fraction state orderings disagree: fit flagged low quality");
    }

    // Posterior decoding with the final parameters
    cancel.checkpoint()?;
    let tables = EmissionTables::new(&parameters, max_count);
    let (tx, rx) = channel();
    rayon::scope(|scope| {
        for chrom_index in 0..chrom_count {
            let tx = tx.clone();
            let parameters = &parameters;
            let tables = &tables;
            scope.spawn(move |_| {
                let chrom_bins = bins
                    .iter()
                    .map(|dim| dim[chrom_index].as_slice())
                    .collect::<Vec<_>>();
                let result = chromosome_posteriors(
                    parameters,
                    tables,
                    &chrom_bins,
                    config.keep_state_posteriors,
                );
                tx.send((chrom_index, result)).unwrap();
            });
        }
    });
    drop(tx);

    let mut log_null = vec![Vec::new(); chrom_count];
    let mut state_posteriors = config
        .keep_state_posteriors
        .then(|| vec![Vec::new(); chrom_count]);
    for (chrom_index, (chrom_log_null, chrom_state_posteriors)) in rx {
        log_null[chrom_index] = chrom_log_null;
        if let Some(all) = state_posteriors.as_mut() {
            all[chrom_index] = chrom_state_posteriors.unwrap();
        }
    }

    Ok(FitResult {
        parameters,
        log_likelihood,
        iterations,
        converged,
        log_null,
        state_posteriors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Single-dimension fixture with an unambiguous three-tier structure
    fn three_tier_bins() -> Vec<GenomeBins> {
        let mut chrom1 = Vec::new();
        // Runs of zero, background and enriched signal
        chrom1.extend(std::iter::repeat(0).take(200));
        chrom1.extend([1, 2, 1, 3, 2, 1, 2, 1, 1, 2].iter().cycle().take(400));
        chrom1.extend([48, 52, 50, 55, 47, 51, 49, 50, 53, 45].iter().cycle().take(100));
        chrom1.extend(std::iter::repeat(0).take(100));
        let chrom2 = [0, 0, 1, 2, 0, 1, 0, 0, 2, 1]
            .iter()
            .cycle()
            .take(300)
            .copied()
            .collect::<Vec<u32>>();
        vec![vec![chrom1, chrom2]]
    }

    #[test]
    fn test_fit_separates_tiers() {
        let bins = three_tier_bins();
        let config = FitConfig::default();
        let result = fit_hmm(StateModel::Analyze, &bins, &config, &CancelToken::new()).unwrap();

        let emissions = &result.parameters.emissions[0];
        assert!(emissions[0].mean < emissions[1].mean);
        assert!(emissions[1].mean > 20.0, "high mean {}", emissions[1].mean);
        assert!(emissions[0].mean < 5.0, "low mean {}", emissions[0].mean);

        // Enriched bins must look non-null, background bins null
        let chrom1 = &result.log_null[0];
        assert!(chrom1[650] < -5.0, "enriched bin log null {}", chrom1[650]);
        assert!(chrom1[300] > chrom1[650]);
        // Zero bins belong to the null set with near certainty
        assert!(chrom1[10] > -0.1, "zero bin log null {}", chrom1[10]);
    }

    #[test]
    fn test_log_null_range_invariant() {
        let bins = three_tier_bins();
        let result = fit_hmm(
            StateModel::Analyze,
            &bins,
            &FitConfig::default(),
            &CancelToken::new(),
        )
        .unwrap();
        for chrom in result.log_null.iter() {
            for value in chrom.iter() {
                assert!(*value <= LOG_NULL_CEILING as f32);
                assert!(value.is_finite());
            }
        }
    }

    #[test]
    fn test_transition_rows_normalized_after_fit() {
        let bins = three_tier_bins();
        let result = fit_hmm(
            StateModel::Analyze,
            &bins,
            &FitConfig::default(),
            &CancelToken::new(),
        )
        .unwrap();
        for row in result.parameters.log_transitions.iter() {
            let total: f64 = row.iter().map(|p| p.exp()).sum();
            approx::assert_abs_diff_eq!(total, 1.0, epsilon = 1e-6);
        }
        let prior_total: f64 = result.parameters.log_priors.iter().map(|p| p.exp()).sum();
        approx::assert_abs_diff_eq!(prior_total, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_empty_coverage_fatal() {
        let bins = vec![vec![vec![0u32; 100], vec![0u32; 50]]];
        let result = fit_hmm(
            StateModel::Analyze,
            &bins,
            &FitConfig::default(),
            &CancelToken::new(),
        );
        assert!(matches!(result, Err(OmnipeakError::Input(_))));
    }

    #[test]
    fn test_cancellation_surfaces() {
        let bins = three_tier_bins();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = fit_hmm(StateModel::Analyze, &bins, &FitConfig::default(), &cancel);
        assert!(matches!(result, Err(OmnipeakError::Cancelled)));
    }

    #[test]
    fn test_compare_alphabet_fits() {
        // Two dimensions where the second has an extra enriched block
        let mut dim1 = vec![0u32; 50];
        dim1.extend([1, 2, 1, 1].iter().cycle().take(200));
        dim1.extend(std::iter::repeat(1).take(50));
        let mut dim2 = vec![0u32; 50];
        dim2.extend([1, 1, 2, 1].iter().cycle().take(200));
        dim2.extend(std::iter::repeat(40).take(50));

        let bins = vec![vec![dim1], vec![dim2]];
        let model = StateModel::Compare {
            group1_dims: 1,
            group2_dims: 1,
        };
        let result =
            fit_hmm(model, &bins, &FitConfig::default(), &CancelToken::new()).unwrap();
        assert_eq!(result.parameters.state_count(), 5);
        // The block enriched only in group 2 must leave the "same" null set
        let log_null = &result.log_null[0];
        assert!(log_null[270] < log_null[100]);
    }
}
