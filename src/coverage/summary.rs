//! Summary-based coverage from continuous BigWig tracks
//!

use camino::Utf8PathBuf;
use log::{debug, info};

use super::{CoverageSource, GenomeBins};
use crate::chrom_list::{get_bin_count, ChromList};
use crate::error::{OmnipeakError, OmnipeakResult};
use crate::stats_util::percentile_sorted;

/// Target window for the 99th-percentile bin signal, in bin-size multiples
const SCALE_TARGET_LOW: f64 = 0.2;
const SCALE_TARGET_HIGH: f64 = 2.0;

/// Coverage source summing continuous coverage values per bin
///
/// A scaling factor keeps the top bin signal in a fixed range so that
/// summary tracks from different pipelines stay comparable.
///
#[derive(Clone)]
pub struct SummaryCoverageSource {
    pub path: Utf8PathBuf,
}

impl SummaryCoverageSource {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    /// Raw per-bin sums of the continuous coverage values
    ///
    /// A chromosome missing from the file yields a zero vector of the
    /// correct length; negative summary values are a fatal inconsistency.
    ///
    fn raw_bin_sums(
        &self,
        chrom_list: &ChromList,
        bin_size: u32,
    ) -> OmnipeakResult<Vec<Vec<f64>>> {
        let mut reader = bigtools::BigWigRead::open_file(self.path.as_str()).map_err(|e| {
            OmnipeakError::Input(format!(
                "unable to open coverage file '{}': {e}",
                self.path
            ))
        })?;

        let present = reader
            .chroms()
            .iter()
            .map(|info| info.name.clone())
            .collect::<std::collections::HashSet<_>>();

        let mut sums = Vec::with_capacity(chrom_list.data.len());
        for info in chrom_list.data.iter() {
            let bin_count = get_bin_count(info.length, bin_size);
            let mut chrom_sums = vec![0.0f64; bin_count];
            if !present.contains(&info.label) {
                debug!(
                    "Chromosome '{}' absent from '{}', using zero coverage",
                    info.label, self.path
                );
                sums.push(chrom_sums);
                continue;
            }

            let intervals = reader
                .get_interval(&info.label, 0, info.length as u32)
                .map_err(|e| {
                    OmnipeakError::Input(format!(
                        "failed to query '{}' from coverage file '{}': {e}",
                        info.label, self.path
                    ))
                })?;
            for interval in intervals {
                let interval = interval.map_err(|e| {
                    OmnipeakError::Input(format!(
                        "failed to decode interval on '{}' of '{}': {e}",
                        info.label, self.path
                    ))
                })?;
                if interval.value < 0.0 {
                    return Err(OmnipeakError::Input(format!(
                        "negative coverage value {} at {}:{} in '{}'",
                        interval.value, info.label, interval.start, self.path
                    )));
                }
                // Distribute the interval value over the bins it covers
                let mut start = interval.start as u64;
                let end = (interval.end as u64).min(info.length);
                while start < end {
                    let bin = (start / bin_size as u64) as usize;
                    let bin_end = ((bin as u64 + 1) * bin_size as u64).min(end);
                    chrom_sums[bin] += interval.value as f64 * (bin_end - start) as f64;
                    start = bin_end;
                }
            }
            sums.push(chrom_sums);
        }
        Ok(sums)
    }

    /// Scaling factor keeping the 99th-percentile nonzero bin signal inside
    /// [0.2 * bin_size, 2.0 * bin_size]
    ///
    fn scale_factor(sums: &[Vec<f64>], bin_size: u32) -> f64 {
        let mut nonzero = sums
            .iter()
            .flatten()
            .copied()
            .filter(|v| *v > 0.0)
            .collect::<Vec<_>>();
        nonzero.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let p99 = match percentile_sorted(&nonzero, 0.99) {
            Some(p99) if p99 > 0.0 => p99,
            _ => return 1.0,
        };
        let low = SCALE_TARGET_LOW * bin_size as f64;
        let high = SCALE_TARGET_HIGH * bin_size as f64;
        if p99 < low {
            low / p99
        } else if p99 > high {
            high / p99
        } else {
            1.0
        }
    }
}

impl CoverageSource for SummaryCoverageSource {
    fn id(&self) -> String {
        self.path.file_stem().unwrap_or("summary").to_string()
    }

    fn load(&self, chrom_list: &ChromList, bin_size: u32) -> OmnipeakResult<GenomeBins> {
        info!("Reading summary coverage from file '{}'", self.path);
        let sums = self.raw_bin_sums(chrom_list, bin_size)?;
        let scale = Self::scale_factor(&sums, bin_size);
        debug!("Summary coverage scale factor: {scale:.4}");
        Ok(sums
            .into_iter()
            .map(|chrom_sums| {
                chrom_sums
                    .into_iter()
                    .map(|value| (value * scale).round() as u32)
                    .collect()
            })
            .collect())
    }
}
