use serde::{Deserialize, Serialize};
use statrs::function::gamma::ln_gamma;

/// Lower bound on the variance/mean ratio of any fitted emission
///
/// Keeps every negative binomial strictly overdispersed so the failure
/// parameter stays finite through EM updates.
///
pub const MIN_OVERDISPERSION: f64 = 1e-3;

const MIN_FAILURES: f64 = 1e-10;
const MIN_MEAN: f64 = 1e-10;

/// Negative binomial emission in (mean, failures) parameterization
///
/// Variance is `mean + mean^2 / failures`.
///
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct NegBinEmission {
    pub mean: f64,
    pub failures: f64,
}

impl NegBinEmission {
    pub fn new(mean: f64, failures: f64) -> Self {
        let mut emission = Self { mean, failures };
        emission.enforce_bounds();
        emission
    }

    /// Construct by method of moments from a weighted mean and variance
    ///
    pub fn from_moments(mean: f64, variance: f64) -> Self {
        if mean <= MIN_MEAN {
            return Self {
                mean: 0.0,
                failures: 1.0,
            };
        }
        let variance = variance.max(mean * (1.0 + MIN_OVERDISPERSION));
        Self::new(mean, mean * mean / (variance - mean))
    }

    /// Clamp failures so that failures > 0 and variance/mean >= 1 + 1e-3
    ///
    fn enforce_bounds(&mut self) {
        if self.mean > MIN_MEAN {
            self.failures = self
                .failures
                .clamp(MIN_FAILURES, self.mean / MIN_OVERDISPERSION);
        } else {
            self.mean = 0.0;
        }
    }

    pub fn variance(&self) -> f64 {
        self.mean + self.mean * self.mean / self.failures
    }

    /// Fraction of per-trial successes implied by (mean, failures)
    ///
    pub fn success_fraction(&self) -> f64 {
        self.mean / (self.mean + self.failures)
    }

    /// Log probability mass at `x`
    ///
    /// A zero-mean emission degenerates to all mass at zero.
    ///
    pub fn ln_pmf(&self, x: u32) -> f64 {
        if self.mean <= MIN_MEAN {
            return if x == 0 { 0.0 } else { f64::NEG_INFINITY };
        }
        let x = x as f64;
        let r = self.failures;
        let ln_denom = (r + self.mean).ln();
        ln_gamma(x + r) - ln_gamma(r) - ln_gamma(x + 1.0)
            + r * (r.ln() - ln_denom)
            + x * (self.mean.ln() - ln_denom)
    }

    /// Update parameters from weighted sample moments, keeping the bounds
    ///
    pub fn set_moments(&mut self, mean: f64, variance: f64) {
        *self = Self::from_moments(mean, variance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ln_pmf_sums_to_one() {
        let emission = NegBinEmission::new(4.0, 2.0);
        let total: f64 = (0..500).map(|x| emission.ln_pmf(x).exp()).sum();
        approx::assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ln_pmf_matches_geometric_case() {
        // With failures = 1 the negative binomial reduces to a geometric
        // distribution with success probability mean / (mean + 1)
        let emission = NegBinEmission::new(1.0, 1.0);
        let p = 0.5f64;
        for x in 0..10u32 {
            let expected = ((1.0 - p) * p.powi(x as i32)).ln();
            approx::assert_abs_diff_eq!(emission.ln_pmf(x), expected, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_degenerate_zero_mean() {
        let emission = NegBinEmission::from_moments(0.0, 0.0);
        assert_eq!(emission.ln_pmf(0), 0.0);
        assert_eq!(emission.ln_pmf(1), f64::NEG_INFINITY);
    }

    #[test]
    fn test_overdispersion_bound() {
        // Underdispersed moments must be pushed back to the allowed ratio
        let emission = NegBinEmission::from_moments(10.0, 5.0);
        assert!(emission.variance() / emission.mean >= 1.0 + MIN_OVERDISPERSION - 1e-12);
        assert!(emission.failures > 0.0);
    }

    #[test]
    fn test_from_moments_round_trip() {
        let emission = NegBinEmission::from_moments(6.0, 18.0);
        approx::assert_abs_diff_eq!(emission.mean, 6.0);
        approx::assert_abs_diff_eq!(emission.variance(), 18.0, epsilon = 1e-9);
    }
}
