//! Linear control rescaling and regression
//!

use log::info;

use super::GenomeBins;

/// Step width of the regression coefficient grid
const BETA_STEP: f64 = 0.01;

/// Scaling of a control track onto its treatment
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ControlScaling {
    /// Linear rescaling factor: total treatment over total control
    pub scale: f64,
    /// Regression coefficient in [0, 1]; zero with regression disabled
    pub beta: f64,
}

/// Total-count ratio between treatment and control
///
pub fn control_scale(treatment: &GenomeBins, control: &GenomeBins) -> f64 {
    let treatment_total: u64 = treatment.iter().flatten().map(|v| *v as u64).sum();
    let control_total: u64 = control.iter().flatten().map(|v| *v as u64).sum();
    if control_total == 0 {
        1.0
    } else {
        treatment_total as f64 / control_total as f64
    }
}

/// Pearson correlation, zero for degenerate inputs
///
pub fn pearson_correlation(x: &[f64], y: &[f64]) -> f64 {
    assert_eq!(x.len(), y.len());
    let n = x.len() as f64;
    if x.is_empty() {
        return 0.0;
    }
    let mean_x = x.iter().sum::<f64>() / n;
    let mean_y = y.iter().sum::<f64>() / n;
    let mut covariance = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for (a, b) in x.iter().zip(y.iter()) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        covariance += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    if var_x <= 0.0 || var_y <= 0.0 {
        return 0.0;
    }
    covariance / (var_x * var_y).sqrt()
}

/// Regression coefficient minimizing the absolute correlation between the
/// regressed treatment and the scaled control
///
/// The coefficient grid runs over [0, 1] in 0.01 steps.
///
pub fn estimate_beta(treatment: &GenomeBins, control: &GenomeBins, scale: f64) -> f64 {
    let scaled_control = control
        .iter()
        .flatten()
        .map(|v| *v as f64 * scale)
        .collect::<Vec<_>>();
    let treatment = treatment
        .iter()
        .flatten()
        .map(|v| *v as f64)
        .collect::<Vec<_>>();

    let steps = (1.0 / BETA_STEP).round() as usize;
    let mut best_beta = 0.0;
    let mut best_correlation = f64::INFINITY;
    let mut regressed = vec![0.0f64; treatment.len()];
    for step in 0..=steps {
        let beta = step as f64 * BETA_STEP;
        for ((slot, t), c) in regressed
            .iter_mut()
            .zip(treatment.iter())
            .zip(scaled_control.iter())
        {
            *slot = t - beta * c;
        }
        let correlation = pearson_correlation(&regressed, &scaled_control).abs();
        if correlation < best_correlation {
            best_correlation = correlation;
            best_beta = beta;
        }
    }
    best_beta
}

/// Full scaling estimate for one treatment/control pair
///
pub fn estimate_scaling(
    treatment: &GenomeBins,
    control: &GenomeBins,
    regression: bool,
) -> ControlScaling {
    let scale = control_scale(treatment, control);
    let beta = if regression {
        estimate_beta(treatment, control, scale)
    } else {
        0.0
    };
    info!("Control scale factor {scale:.4}, regression coefficient {beta:.2}");
    ControlScaling { scale, beta }
}

/// Control-regressed per-bin counts: max(0, T - beta * scale * C), rounded
///
pub fn normalized_bins(
    treatment: &[u32],
    control: &[u32],
    scaling: &ControlScaling,
) -> Vec<u32> {
    treatment
        .iter()
        .zip(control.iter())
        .map(|(t, c)| {
            let regressed = *t as f64 - scaling.beta * scaling.scale * *c as f64;
            regressed.max(0.0).round() as u32
        })
        .collect()
}

/// Control counts rescaled onto the treatment scale
///
pub fn scaled_bins(control: &[u32], scale: f64) -> Vec<f64> {
    control.iter().map(|c| *c as f64 * scale).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chrom_list::get_bin_index;

    /// Bin read positions over a single test chromosome
    fn bins_from_positions(positions: &[u64], bin_size: u32, bin_count: usize) -> GenomeBins {
        let mut bins = vec![vec![0u32; bin_count]];
        for pos in positions {
            bins[0][get_bin_index(*pos, bin_size)] += 1;
        }
        bins
    }

    #[test]
    fn test_control_scale_from_read_positions() {
        let treatment = bins_from_positions(&[1, 2, 3, 4, 5, 10, 11, 15], 2, 16);
        let control =
            bins_from_positions(&[0, 2, 4, 6, 10, 12, 14, 20, 21, 22, 25], 2, 16);
        let scale = control_scale(&treatment, &control);
        approx::assert_abs_diff_eq!(scale, 8.0 / 11.0, epsilon = 1e-12);
        approx::assert_abs_diff_eq!(scale, 0.72, epsilon = 0.01);
    }

    #[test]
    fn test_control_scale_empty_control() {
        let treatment = bins_from_positions(&[1, 2], 2, 4);
        let control = vec![vec![0u32; 4]];
        assert_eq!(control_scale(&treatment, &control), 1.0);
    }

    #[test]
    fn test_pearson_correlation() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let y = [2.0, 4.0, 6.0, 8.0];
        approx::assert_abs_diff_eq!(pearson_correlation(&x, &y), 1.0, epsilon = 1e-12);
        let inverted = [8.0, 6.0, 4.0, 2.0];
        approx::assert_abs_diff_eq!(
            pearson_correlation(&x, &inverted),
            -1.0,
            epsilon = 1e-12
        );
        assert_eq!(pearson_correlation(&x, &[5.0; 4]), 0.0);
    }

    #[test]
    fn test_estimate_beta_removes_control_component() {
        // Treatment is signal plus exactly half the scaled control, so the
        // regression grid must settle near beta = 0.5
        let control = vec![vec![0u32, 10, 20, 30, 0, 40, 10, 0, 20, 10]];
        let signal = [0u32, 3, 0, 2, 0, 1, 0, 4, 0, 2];
        let treatment = vec![control[0]
            .iter()
            .zip(signal.iter())
            .map(|(c, s)| c / 2 + s)
            .collect::<Vec<_>>()];

        let scale = control_scale(&treatment, &control);
        let beta = estimate_beta(&treatment, &control, scale);
        let expected = 0.5 / scale;
        approx::assert_abs_diff_eq!(beta, expected, epsilon = 0.05);
        assert!((0.0..=1.0).contains(&beta));
    }

    #[test]
    fn test_estimate_scaling_regression_off() {
        let treatment = bins_from_positions(&[1, 5, 9], 2, 8);
        let control = bins_from_positions(&[0, 4, 8, 12], 2, 8);
        let scaling = estimate_scaling(&treatment, &control, false);
        assert_eq!(scaling.beta, 0.0);
        approx::assert_abs_diff_eq!(scaling.scale, 0.75);
    }

    #[test]
    fn test_normalized_bins_clamped_non_negative() {
        let scaling = ControlScaling {
            scale: 2.0,
            beta: 1.0,
        };
        let normalized = normalized_bins(&[5, 1, 0], &[1, 3, 0], &scaling);
        assert_eq!(normalized, vec![3, 0, 0]);
    }
}
