//! Multiple-testing correction carried out entirely in the log domain
//!
//! Candidate p-values routinely underflow f64 in linear space, so both
//! procedures transform log p-values directly into log q-values.
//!

/// Supported correction procedures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Correction {
    BenjaminiHochberg,
    Bonferroni,
}

/// Benjamini-Hochberg adjustment of log p-values
///
/// Returns log q-values in the original input order. The k-th smallest
/// log p becomes log p + ln(M) - ln(k+1), followed by the standard monotone
/// non-increase enforcement from the largest p downward.
///
pub fn log_benjamini_hochberg(log_ps: &[f64]) -> Vec<f64> {
    let m = log_ps.len();
    if m == 0 {
        return Vec::new();
    }
    let ln_m = (m as f64).ln();

    let mut order = (0..m).collect::<Vec<_>>();
    order.sort_by(|a, b| log_ps[*a].partial_cmp(&log_ps[*b]).unwrap());

    let mut adjusted = order
        .iter()
        .enumerate()
        .map(|(k, index)| log_ps[*index] + ln_m - ((k + 1) as f64).ln())
        .collect::<Vec<_>>();

    // Enforce monotonicity with a running minimum from the largest p down,
    // clamping at log q = 0 (q = 1)
    let mut running_min = 0.0f64;
    for value in adjusted.iter_mut().rev() {
        running_min = running_min.min(*value);
        *value = running_min;
    }

    let mut log_qs = vec![0.0; m];
    for (k, index) in order.iter().enumerate() {
        log_qs[*index] = adjusted[k];
    }
    log_qs
}

/// Bonferroni adjustment of log p-values
///
pub fn log_bonferroni(log_ps: &[f64]) -> Vec<f64> {
    let ln_m = (log_ps.len() as f64).ln();
    log_ps.iter().map(|p| (p + ln_m).min(0.0)).collect()
}

pub fn correct(log_ps: &[f64], method: Correction) -> Vec<f64> {
    match method {
        Correction::BenjaminiHochberg => log_benjamini_hochberg(log_ps),
        Correction::Bonferroni => log_bonferroni(log_ps),
    }
}
