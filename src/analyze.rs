//! The analyze command: wire coverage inputs through the engine and write
//! all run outputs
//!

use std::sync::Arc;

use camino::Utf8PathBuf;
use log::{error, info};
use unwrap::unwrap;

use crate::bigwig_utils::write_cpm_bigwig;
use crate::chrom_list::ChromList;
use crate::cli;
use crate::coverage::control::{estimate_scaling, normalized_bins, scaled_bins};
use crate::coverage::reads::ReadCoverageSource;
use crate::coverage::summary::SummaryCoverageSource;
use crate::coverage::{CoverageCache, CoverageFormat, CoverageSource, GenomeBins};
use crate::engine::{call_peaks, call_peaks_from_fit, AnalyzeConfig, EngineInput, RunStats};
use crate::error::{CancelToken, OmnipeakError, OmnipeakResult};
use crate::fit_store::{fit_exists, fit_identifier, load_fit, save_fit, FitInformation};
use crate::genome_regions::GenomeRegions;
use crate::hmm::FitConfig;
use crate::multiple_testing::Correction;
use crate::peaks::write_peaks_bed;

pub const PEAKS_FILENAME: &str = "peaks.bed";
pub const COVERAGE_BIGWIG_FILENAME: &str = "coverage.bw";
pub const RUN_STATS_FILENAME: &str = "run.stats.json";

fn build_source(
    path: &Utf8PathBuf,
    settings: &cli::AnalyzeSettings,
) -> OmnipeakResult<Box<dyn CoverageSource>> {
    let format = settings
        .forced_format()
        .or_else(|| CoverageFormat::from_extension(path))
        .ok_or_else(|| {
            OmnipeakError::Config(format!(
                "can't determine the format of '{path}' from its extension; use --format"
            ))
        })?;
    Ok(match format {
        CoverageFormat::BigWig => Box::new(SummaryCoverageSource::new(path.clone())),
        format => Box::new(ReadCoverageSource::new(
            path.clone(),
            format,
            settings.fragment,
            settings.unique,
        )),
    })
}

/// Pair every treatment file with its control file, if controls were given
///
fn control_for_treatment(
    settings: &cli::AnalyzeSettings,
    dim: usize,
) -> Option<&Utf8PathBuf> {
    match settings.control_filenames.len() {
        0 => None,
        1 => settings.control_filenames.first(),
        _ => settings.control_filenames.get(dim),
    }
}

/// Assemble the engine input from loaded treatment and control coverage
///
fn prepare_engine_input(
    chrom_list: ChromList,
    treatments: &[Arc<GenomeBins>],
    controls: &[Option<Arc<GenomeBins>>],
    blacklist: Option<GenomeRegions>,
    regression: bool,
) -> EngineInput {
    let chrom_count = chrom_list.chrom_count();
    let any_control = controls.iter().any(|control| control.is_some());

    let mut fit_bins = Vec::with_capacity(treatments.len());
    let mut signal: GenomeBins = (0..chrom_count)
        .map(|chrom_index| vec![0u32; treatments[0][chrom_index].len()])
        .collect();
    let mut control_sum = any_control.then(|| {
        (0..chrom_count)
            .map(|chrom_index| vec![0.0f64; treatments[0][chrom_index].len()])
            .collect::<Vec<_>>()
    });

    for (treatment, control) in treatments.iter().zip(controls.iter()) {
        for (chrom_index, chrom_bins) in treatment.iter().enumerate() {
            for (slot, count) in signal[chrom_index].iter_mut().zip(chrom_bins.iter()) {
                *slot += count;
            }
        }
        match control {
            Some(control) => {
                let scaling = estimate_scaling(treatment, control, regression);
                let dim_bins = (0..chrom_count)
                    .map(|chrom_index| {
                        normalized_bins(
                            &treatment[chrom_index],
                            &control[chrom_index],
                            &scaling,
                        )
                    })
                    .collect::<Vec<_>>();
                if let Some(control_sum) = control_sum.as_mut() {
                    for (chrom_index, chrom_control) in control.iter().enumerate() {
                        let scaled = scaled_bins(chrom_control, scaling.scale);
                        for (slot, value) in
                            control_sum[chrom_index].iter_mut().zip(scaled.iter())
                        {
                            *slot += value;
                        }
                    }
                }
                fit_bins.push(dim_bins);
            }
            None => {
                fit_bins.push(treatment.as_ref().clone());
            }
        }
    }

    EngineInput {
        chrom_list,
        fit_bins,
        signal,
        control: control_sum,
        blacklist,
    }
}

fn run_analyze_impl(settings: &cli::AnalyzeSettings) -> OmnipeakResult<RunStats> {
    let cancel = CancelToken::new();
    let chrom_list = ChromList::from_chrom_sizes(&settings.chrom_sizes_filename)?;
    info!(
        "Genome layout: {} chromosome(s), bin size {}",
        chrom_list.chrom_count(),
        settings.bin
    );

    let blacklist = match settings.blacklist_filename.as_ref() {
        Some(filename) => Some(GenomeRegions::from_bed(filename, "blacklist")?),
        None => None,
    };

    // Decode and bin all coverage inputs through the engine-owned cache
    let mut cache = CoverageCache::new();
    let mut treatments = Vec::new();
    let mut controls = Vec::new();
    for (dim, treatment_path) in settings.treatment_filenames.iter().enumerate() {
        let source = build_source(treatment_path, settings)?;
        treatments.push(cache.get_or_load(source.as_ref(), &chrom_list, settings.bin)?);

        controls.push(match control_for_treatment(settings, dim) {
            Some(control_path) => {
                let source = build_source(control_path, settings)?;
                Some(cache.get_or_load(source.as_ref(), &chrom_list, settings.bin)?)
            }
            None => None,
        });
    }

    let regression = !settings.no_regress_control;
    let input = prepare_engine_input(
        chrom_list,
        &treatments,
        &controls,
        blacklist,
        regression,
    );

    // Reuse a persisted fit when its configuration matches, fit otherwise
    let stems = |paths: &[Utf8PathBuf]| {
        paths
            .iter()
            .map(|path| path.file_stem().unwrap_or("input").to_string())
            .collect::<Vec<_>>()
    };
    let treatment_stems = stems(&settings.treatment_filenames);
    let control_stems = stems(&settings.control_filenames);
    let information = FitInformation {
        identifier: fit_identifier(
            &treatment_stems.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            &control_stems.iter().map(|s| s.as_str()).collect::<Vec<_>>(),
            settings.fragment,
            settings.bin,
            settings.unique,
            regression,
        ),
        bin_size: settings.bin,
        fragment: settings.fragment,
        unique: settings.unique,
        control_regression: regression,
        treatment_paths: settings
            .treatment_filenames
            .iter()
            .map(|path| path.to_string())
            .collect(),
        control_paths: settings
            .control_filenames
            .iter()
            .map(|path| path.to_string())
            .collect(),
        chrom_sizes: input.chrom_list.to_entries(),
    };

    let config = AnalyzeConfig {
        bin_size: settings.bin,
        fdr: settings.fdr,
        sensitivity: settings.sensitivity,
        gap: settings.gap.map(|gap| gap as usize),
        summits: settings.summits,
        summit_bandwidth: settings.summit_bandwidth,
        clip: settings.clip,
        correction: if settings.bonferroni {
            Correction::Bonferroni
        } else {
            Correction::BenjaminiHochberg
        },
        fit: FitConfig::default(),
        peak_name_prefix: settings.peaks_prefix.clone(),
    };

    let (peaks, stats) = if fit_exists(&settings.output_dir) {
        let fit = load_fit(&settings.output_dir, &information)?;
        call_peaks_from_fit(&input, &fit, &config, &cancel)?
    } else {
        let outcome = call_peaks(&input, &config, &cancel)?;
        save_fit(&settings.output_dir, &information, &outcome.fit)?;
        (outcome.peaks, outcome.stats)
    };

    write_peaks_bed(&settings.output_dir.join(PEAKS_FILENAME), &peaks)?;

    if settings.write_bigwig {
        write_cpm_bigwig(
            &settings.output_dir.join(COVERAGE_BIGWIG_FILENAME),
            &input.chrom_list,
            &input.signal,
            settings.bin,
            input.blacklist.as_ref(),
        )?;
    }

    let stats_path = settings.output_dir.join(RUN_STATS_FILENAME);
    let stats_json = serde_json::to_string_pretty(&stats)
        .map_err(|e| OmnipeakError::Input(format!("can't serialize run stats: {e}")))?;
    std::fs::write(&stats_path, stats_json)
        .map_err(|e| OmnipeakError::io(stats_path.clone(), e))?;

    Ok(stats)
}

/// Entry point of the analyze command
///
pub fn run_analyze(shared_settings: &cli::SharedSettings, settings: &cli::AnalyzeSettings) {
    let worker_pool = unwrap!(
        rayon::ThreadPoolBuilder::new()
            .num_threads(shared_settings.thread_count)
            .build(),
        "Failed to build worker thread pool with {} threads",
        shared_settings.thread_count
    );

    match worker_pool.install(|| run_analyze_impl(settings)) {
        Ok(stats) => {
            info!(
                "Analyze finished: {} peak(s) from {} candidate(s)",
                stats.peak_count, stats.candidate_count
            );
        }
        Err(err) => {
            error!("{err}");
            let code = match err {
                OmnipeakError::Config(_) => exitcode::USAGE,
                OmnipeakError::Io { .. } => exitcode::IOERR,
                _ => exitcode::DATAERR,
            };
            std::process::exit(code);
        }
    }
}
