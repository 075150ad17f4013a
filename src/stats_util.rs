//! Shared numerical routines for log-space probability arithmetic
//!

/// Numerically stable log(exp(a) + exp(b))
///
pub fn log_add_exp(a: f64, b: f64) -> f64 {
    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    if hi == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    hi + (lo - hi).exp().ln_1p()
}

/// Numerically stable log of the sum of exponentials over a slice
///
pub fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY {
        return f64::NEG_INFINITY;
    }
    let sum: f64 = values.iter().map(|v| (v - max).exp()).sum();
    max + sum.ln()
}

/// Compensated summation accumulator
///
/// Used where many small log-prob terms of similar sign are combined and the
/// naive running sum would lose precision.
///
#[derive(Default, Clone, Copy)]
pub struct KahanSum {
    sum: f64,
    compensation: f64,
}

impl KahanSum {
    pub fn add(&mut self, value: f64) {
        let y = value - self.compensation;
        let t = self.sum + y;
        self.compensation = (t - self.sum) - y;
        self.sum = t;
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }
}

/// Median of an unsorted value slice
///
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Percentile by linear interpolation over a sorted slice
///
/// `q` is in [0, 1].
///
pub fn percentile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = q * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] * (1.0 - frac) + sorted[hi] * frac)
}

/// Number of cached log-factorial prefix sums
const LOG_FACTORIAL_CACHE_SIZE: usize = 10_001;

/// Prefix-sum table of log factorials with an incremental `ln(i)` fallback
/// beyond the cached range
///
pub struct LogFactorialTable {
    table: Vec<f64>,
}

impl Default for LogFactorialTable {
    fn default() -> Self {
        let mut table = Vec::with_capacity(LOG_FACTORIAL_CACHE_SIZE);
        table.push(0.0);
        for i in 1..LOG_FACTORIAL_CACHE_SIZE {
            let prev = table[i - 1];
            table.push(prev + (i as f64).ln());
        }
        Self { table }
    }
}

impl LogFactorialTable {
    pub fn ln_factorial(&self, n: u64) -> f64 {
        if (n as usize) < self.table.len() {
            self.table[n as usize]
        } else {
            // Extend from the cached prefix by adding ln(i) terms
            let mut value = *self.table.last().unwrap();
            for i in self.table.len() as u64..=n {
                value += (i as f64).ln();
            }
            value
        }
    }

    /// Log of the upper Poisson tail P(N >= k | lambda)
    ///
    /// Terms are accumulated through a logsumexp recurrence until successive
    /// partial sums differ by less than 1e-5.
    ///
    pub fn log_poisson_upper_tail(&self, k: u64, lambda: f64) -> f64 {
        assert!(lambda > 0.0);
        if k == 0 {
            return 0.0;
        }

        const CONVERGENCE: f64 = 1e-5;

        let ln_lambda = lambda.ln();
        let mut i = k;
        let mut ln_term = -lambda + k as f64 * ln_lambda - self.ln_factorial(k);
        let mut acc = ln_term;
        loop {
            i += 1;
            ln_term += ln_lambda - (i as f64).ln();
            let next = log_add_exp(acc, ln_term);
            let converged = next - acc < CONVERGENCE && (i as f64) > lambda;
            acc = next;
            if converged {
                break;
            }
        }
        // A log survival probability can never exceed 0
        acc.min(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statrs::distribution::{DiscreteCDF, Poisson};

    #[test]
    fn test_log_sum_exp() {
        let values = [0.1f64, 0.4, 0.5];
        let ln_values = values.iter().map(|v| v.ln()).collect::<Vec<_>>();
        approx::assert_abs_diff_eq!(log_sum_exp(&ln_values), 0.0, epsilon = 1e-12);
        assert_eq!(log_sum_exp(&[]), f64::NEG_INFINITY);
        assert_eq!(
            log_sum_exp(&[f64::NEG_INFINITY, f64::NEG_INFINITY]),
            f64::NEG_INFINITY
        );
    }

    #[test]
    fn test_log_add_exp() {
        let v = log_add_exp(0.5f64.ln(), 0.25f64.ln());
        approx::assert_abs_diff_eq!(v, 0.75f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_kahan_sum() {
        let mut acc = KahanSum::default();
        for _ in 0..1_000_000 {
            acc.add(0.1);
        }
        approx::assert_abs_diff_eq!(acc.sum(), 100_000.0, epsilon = 1e-6);
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[3.0, 1.0, 2.0]), Some(2.0));
        assert_eq!(median(&[4.0, 1.0, 2.0, 3.0]), Some(2.5));
    }

    #[test]
    fn test_percentile_sorted() {
        let values = (0..101).map(|v| v as f64).collect::<Vec<_>>();
        assert_eq!(percentile_sorted(&values, 0.0), Some(0.0));
        assert_eq!(percentile_sorted(&values, 0.5), Some(50.0));
        assert_eq!(percentile_sorted(&values, 0.99), Some(99.0));
        assert_eq!(percentile_sorted(&values, 1.0), Some(100.0));
    }

    #[test]
    fn test_ln_factorial() {
        let table = LogFactorialTable::default();
        approx::assert_abs_diff_eq!(table.ln_factorial(0), 0.0);
        approx::assert_abs_diff_eq!(table.ln_factorial(5), 120f64.ln(), epsilon = 1e-12);
        // Past the cached range the value extends by ln(i) terms
        let expected: f64 = (1..=10_200u64).map(|i| (i as f64).ln()).sum();
        approx::assert_abs_diff_eq!(table.ln_factorial(10_200), expected, epsilon = 1e-6);
    }

    #[test]
    fn test_log_poisson_upper_tail() {
        let table = LogFactorialTable::default();
        for (k, lambda) in [(10u64, 5.0f64), (3, 10.0), (50, 20.0), (1, 0.5)] {
            let expected = Poisson::new(lambda).unwrap().sf(k - 1).ln();
            let observed = table.log_poisson_upper_tail(k, lambda);
            approx::assert_abs_diff_eq!(observed, expected, epsilon = 1e-4);
        }
        assert_eq!(table.log_poisson_upper_tail(0, 1.0), 0.0);
    }
}
