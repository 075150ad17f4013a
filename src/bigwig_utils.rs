//! BigWig track output helpers
//!

use std::collections::HashMap;

use bigtools::beddata::BedParserStreamingIterator;
use bigtools::{BigWigWrite, Value};
use camino::Utf8Path;
use log::info;

use crate::chrom_list::ChromList;
use crate::coverage::GenomeBins;
use crate::error::{OmnipeakError, OmnipeakResult};
use crate::genome_regions::GenomeRegions;

/// Write a counts-per-million-normalized coverage track
///
/// Bins intersecting blacklisted regions are zeroed before normalization is
/// applied; zero bins are omitted from the track.
///
pub fn write_cpm_bigwig(
    filename: &Utf8Path,
    chrom_list: &ChromList,
    bins: &GenomeBins,
    bin_size: u32,
    blacklist: Option<&GenomeRegions>,
) -> OmnipeakResult<()> {
    info!("Writing CPM coverage track to bigwig file: '{filename}'");

    let chrom_map = chrom_list
        .data
        .iter()
        .map(|info| (info.label.clone(), info.length as u32))
        .collect::<HashMap<_, _>>();

    let mut total_count = 0u64;
    let mut values: Vec<(String, Value)> = Vec::new();
    for (chrom_index, info) in chrom_list.data.iter().enumerate() {
        for (bin, count) in bins[chrom_index].iter().enumerate() {
            if *count == 0 {
                continue;
            }
            let start = bin as u64 * bin_size as u64;
            let end = (start + bin_size as u64).min(info.length);
            if let Some(blacklist) = blacklist {
                if blacklist.intersect(&info.label, start as i64, end as i64) {
                    continue;
                }
            }
            total_count += *count as u64;
            values.push((
                info.label.clone(),
                Value {
                    start: start as u32,
                    end: end as u32,
                    value: *count as f32,
                },
            ));
        }
    }

    let cpm_factor = if total_count > 0 {
        1e6 / total_count as f64
    } else {
        1.0
    };
    for (_, value) in values.iter_mut() {
        value.value = (value.value as f64 * cpm_factor) as f32;
    }

    let writer = BigWigWrite::create_file(filename.as_std_path(), chrom_map).map_err(|e| {
        OmnipeakError::Input(format!("unable to create bigwig file '{filename}': {e}"))
    })?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .map_err(|e| OmnipeakError::io(filename.to_owned(), e))?;
    let data = BedParserStreamingIterator::wrap_iter(
        values.into_iter().map(Ok::<_, std::io::Error>),
        true,
    );
    writer.write(data, runtime).map_err(|e| {
        OmnipeakError::Input(format!("failed to write bigwig file '{filename}': {e}"))
    })
}
