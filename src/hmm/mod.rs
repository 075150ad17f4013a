//! Zero-inflated multivariate negative-binomial hidden Markov models
//!
//! A single parameter struct covers both supported state alphabets; the
//! alphabet is a value, not a type hierarchy. State 0 is always the
//! zero-inflation state with all probability mass at zero coverage.
//!

mod fit;
mod negbin;

pub use self::fit::{fit_hmm, FitConfig, FitResult, GenomeBins, LOG_NULL_CEILING};
pub use self::negbin::NegBinEmission;

use serde::{Deserialize, Serialize};
use strum::EnumCount;

/// Emission level a non-zero state assigns to one track dimension
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumCount)]
pub enum Level {
    Low,
    High,
}

/// State alphabet of the model
///
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum StateModel {
    /// Three states {Z, L, H}; the null hypothesis set is {Z, L}
    Analyze,

    /// Five states {Z, L, H, I, D} over two replicate groups
    ///
    /// I constrains the first group's dimensions to High and the second's to
    /// Low, D is the reverse. The null hypothesis set is "same in both
    /// groups": {Z, L, H}.
    ///
    Compare {
        group1_dims: usize,
        group2_dims: usize,
    },
}

impl StateModel {
    pub fn state_count(&self) -> usize {
        match self {
            StateModel::Analyze => 3,
            StateModel::Compare { .. } => 5,
        }
    }

    pub fn null_states(&self) -> &'static [usize] {
        match self {
            StateModel::Analyze => &[0, 1],
            StateModel::Compare { .. } => &[0, 1, 2],
        }
    }

    /// Emission level of `dim` under non-zero state `state`
    ///
    pub fn emission_level(&self, state: usize, dim: usize) -> Level {
        assert!(state > 0 && state < self.state_count());
        match self {
            StateModel::Analyze => {
                if state == 1 {
                    Level::Low
                } else {
                    Level::High
                }
            }
            StateModel::Compare { group1_dims, .. } => {
                let in_group1 = dim < *group1_dims;
                match state {
                    1 => Level::Low,
                    2 => Level::High,
                    3 => {
                        if in_group1 {
                            Level::High
                        } else {
                            Level::Low
                        }
                    }
                    _ => {
                        if in_group1 {
                            Level::Low
                        } else {
                            Level::High
                        }
                    }
                }
            }
        }
    }

    /// State permutation corresponding to a Low/High level exchange
    ///
    pub fn level_swap_permutation(&self) -> Vec<usize> {
        match self {
            StateModel::Analyze => vec![0, 2, 1],
            StateModel::Compare { .. } => vec![0, 2, 1, 4, 3],
        }
    }

    /// Default state priors used before the first EM iteration
    ///
    pub fn default_priors(&self) -> Vec<f64> {
        match self {
            StateModel::Analyze => vec![0.75, 0.249, 0.001],
            StateModel::Compare { .. } => vec![0.75, 0.22, 0.02, 0.005, 0.005],
        }
    }

    /// Default state transition rows used before the first EM iteration
    ///
    pub fn default_transitions(&self) -> Vec<Vec<f64>> {
        match self {
            StateModel::Analyze => vec![
                vec![0.75, 0.2499, 0.0001],
                vec![0.2, 0.798, 0.002],
                vec![0.005, 0.015, 0.98],
            ],
            StateModel::Compare { .. } => vec![
                vec![0.75, 0.2497, 0.0001, 0.0001, 0.0001],
                vec![0.2, 0.795, 0.003, 0.001, 0.001],
                vec![0.004, 0.014, 0.976, 0.003, 0.003],
                vec![0.004, 0.014, 0.003, 0.976, 0.003],
                vec![0.004, 0.014, 0.003, 0.003, 0.976],
            ],
        }
    }
}

/// Quality flags recorded while fitting
///
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct FitFlags {
    /// Mean and success-fraction orderings disagreed after EM
    pub low_quality: bool,
    /// High/low mean ratio was clamped to the configured minimum
    pub out_of_snr_range: bool,
}

/// Parameters of the zero-inflated negative-binomial HMM
///
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct HmmParameters {
    pub model: StateModel,
    pub log_priors: Vec<f64>,
    pub log_transitions: Vec<Vec<f64>>,
    /// Per track dimension: [Low, High] emissions shared across states
    pub emissions: Vec<[NegBinEmission; 2]>,
    pub flags: FitFlags,
}

impl HmmParameters {
    pub fn new(model: StateModel, emissions: Vec<[NegBinEmission; 2]>) -> Self {
        let priors = model.default_priors();
        let transitions = model.default_transitions();
        Self {
            model,
            log_priors: priors.iter().map(|p| p.ln()).collect(),
            log_transitions: transitions
                .iter()
                .map(|row| row.iter().map(|p| p.ln()).collect())
                .collect(),
            emissions,
            flags: FitFlags::default(),
        }
    }

    pub fn state_count(&self) -> usize {
        self.model.state_count()
    }

    pub fn dimension_count(&self) -> usize {
        self.emissions.len()
    }

    /// Log emission probability of one multi-dimensional observation
    ///
    /// State 0 is degenerate: probability one at all-zero observations and
    /// zero elsewhere.
    ///
    pub fn emission_ln_prob(&self, state: usize, obs: &[u32]) -> f64 {
        if state == 0 {
            return if obs.iter().all(|x| *x == 0) {
                0.0
            } else {
                f64::NEG_INFINITY
            };
        }
        let mut ln_prob = 0.0;
        for (dim, x) in obs.iter().enumerate() {
            let level = self.model.emission_level(state, dim);
            ln_prob += self.emissions[dim][level as usize].ln_pmf(*x);
        }
        ln_prob
    }

    fn mean_indicates_swap(&self) -> bool {
        let low: f64 = self.emissions.iter().map(|e| e[0].mean).sum();
        let high: f64 = self.emissions.iter().map(|e| e[1].mean).sum();
        low > high
    }

    fn success_indicates_swap(&self) -> bool {
        let low: f64 = self.emissions.iter().map(|e| e[0].success_fraction()).sum();
        let high: f64 = self.emissions.iter().map(|e| e[1].success_fraction()).sum();
        low > high
    }

    /// Restore the mean ordering of the Low and High levels after EM
    ///
    /// States are exchanged only when both the mean and the success-fraction
    /// criteria agree on the swap; a disagreement marks the fit low quality
    /// and leaves the states unchanged.
    ///
    pub fn order_states(&mut self) -> bool {
        let by_mean = self.mean_indicates_swap();
        let by_success = self.success_indicates_swap();
        if by_mean != by_success {
            self.flags.low_quality = true;
            return false;
        }
        if !by_mean {
            return false;
        }

        for emission in self.emissions.iter_mut() {
            emission.swap(0, 1);
        }
        let perm = self.model.level_swap_permutation();
        let k = self.state_count();

        let old_priors = self.log_priors.clone();
        let old_transitions = self.log_transitions.clone();
        for i in 0..k {
            self.log_priors[i] = old_priors[perm[i]];
            for j in 0..k {
                self.log_transitions[i][j] = old_transitions[perm[i]][perm[j]];
            }
        }
        true
    }
}
