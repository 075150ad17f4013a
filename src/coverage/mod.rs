//! Binned coverage providers
//!
//! Each source kind decodes one treatment or control file into per-bin
//! integer counts over a shared chromosome layout. Sources are constructed,
//! loaded once through the engine-owned cache, then frozen; no source keeps
//! interior mutable state.
//!

pub mod control;
pub mod reads;
pub mod summary;

use std::collections::HashMap;
use std::sync::Arc;

use camino::Utf8Path;

use crate::chrom_list::ChromList;
use crate::error::OmnipeakResult;
use crate::int_range::IntRange;

/// Per-bin counts of every chromosome in canonical order
pub type GenomeBins = Vec<Vec<u32>>;

/// Input format of one coverage source
///
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoverageFormat {
    /// Alignment records decoded by htslib (BAM, SAM or CRAM)
    Reads,
    /// BED intervals, plain or bgzip-compressed
    Bed,
    /// Continuous coverage summaries from a BigWig file
    BigWig,
}

impl CoverageFormat {
    /// Select the format from the file extension
    ///
    pub fn from_extension(path: &Utf8Path) -> Option<Self> {
        let name = path.file_name()?.to_lowercase();
        if name.ends_with(".bam") || name.ends_with(".sam") || name.ends_with(".cram") {
            Some(CoverageFormat::Reads)
        } else if name.ends_with(".bed") || name.ends_with(".bed.gz") {
            Some(CoverageFormat::Bed)
        } else if name.ends_with(".bw") || name.ends_with(".bigwig") {
            Some(CoverageFormat::BigWig)
        } else {
            None
        }
    }
}

/// Narrow interface every binned coverage source implements
///
pub trait CoverageSource {
    /// Deterministic identifier used for cache keying
    fn id(&self) -> String;

    /// Decode and bin the full genome
    fn load(&self, chrom_list: &ChromList, bin_size: u32) -> OmnipeakResult<GenomeBins>;
}

/// Engine-owned cache of loaded coverage keyed by source identifier
///
#[derive(Default)]
pub struct CoverageCache {
    loaded: HashMap<String, Arc<GenomeBins>>,
}

impl CoverageCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(
        &mut self,
        source: &dyn CoverageSource,
        chrom_list: &ChromList,
        bin_size: u32,
    ) -> OmnipeakResult<Arc<GenomeBins>> {
        let key = source.id();
        if let Some(bins) = self.loaded.get(&key) {
            return Ok(bins.clone());
        }
        let bins = Arc::new(source.load(chrom_list, bin_size)?);
        self.loaded.insert(key, bins.clone());
        Ok(bins)
    }
}

/// Sum of counts over a bin range
///
pub fn score_bin_range(bins: &[u32], range: &IntRange) -> u64 {
    bins[range.start as usize..range.end as usize]
        .iter()
        .map(|v| *v as u64)
        .sum()
}

/// Sum of counts over a base range, prorating bins covered partially
///
pub fn score_base_range(bins: &[u32], bin_size: u32, range: &IntRange) -> f64 {
    let bin_size = bin_size as i64;
    let first_bin = (range.start / bin_size).max(0);
    let last_bin = ((range.end + bin_size - 1) / bin_size).min(bins.len() as i64);

    let mut total = 0.0f64;
    for bin in first_bin..last_bin {
        let bin_start = bin * bin_size;
        let bin_end = bin_start + bin_size;
        let overlap = range.end.min(bin_end) - range.start.max(bin_start);
        if overlap > 0 {
            total += bins[bin as usize] as f64 * overlap as f64 / bin_size as f64;
        }
    }
    total
}

/// Indices of chromosomes whose treatment coverage is identically zero
///
/// These are removed from the effective genome query before fitting.
///
pub fn zero_coverage_chroms(dimensions: &[GenomeBins]) -> Vec<usize> {
    let chrom_count = dimensions[0].len();
    (0..chrom_count)
        .filter(|chrom_index| {
            dimensions
                .iter()
                .all(|bins| bins[*chrom_index].iter().all(|count| *count == 0))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_from_extension() {
        let path = |s: &str| Utf8Path::new(s).to_owned();
        assert_eq!(
            CoverageFormat::from_extension(&path("a/b/sample.BAM")),
            Some(CoverageFormat::Reads)
        );
        assert_eq!(
            CoverageFormat::from_extension(&path("x.cram")),
            Some(CoverageFormat::Reads)
        );
        assert_eq!(
            CoverageFormat::from_extension(&path("x.bed.gz")),
            Some(CoverageFormat::Bed)
        );
        assert_eq!(
            CoverageFormat::from_extension(&path("x.bigWig")),
            Some(CoverageFormat::BigWig)
        );
        assert_eq!(CoverageFormat::from_extension(&path("x.txt")), None);
    }

    #[test]
    fn test_score_bin_range() {
        let bins = vec![1u32, 2, 3, 4, 5];
        assert_eq!(score_bin_range(&bins, &IntRange::from_pair(1, 4)), 9);
        assert_eq!(score_bin_range(&bins, &IntRange::from_pair(0, 0)), 0);
    }

    #[test]
    fn test_score_base_range_prorates_bins() {
        let bins = vec![10u32, 20, 30];
        // Half of bin 0 plus all of bin 1
        let score = score_base_range(&bins, 100, &IntRange::from_pair(50, 200));
        approx::assert_abs_diff_eq!(score, 25.0);
        // A sliver inside one bin
        let sliver = score_base_range(&bins, 100, &IntRange::from_pair(210, 220));
        approx::assert_abs_diff_eq!(sliver, 3.0);
        // Ranges beyond the binned region contribute nothing
        let beyond = score_base_range(&bins, 100, &IntRange::from_pair(250, 400));
        approx::assert_abs_diff_eq!(beyond, 15.0);
    }

    #[test]
    fn test_zero_coverage_chroms() {
        let dim1 = vec![vec![0u32, 0], vec![1, 0], vec![0, 0]];
        let dim2 = vec![vec![0u32, 0], vec![0, 0], vec![0, 2]];
        assert_eq!(zero_coverage_chroms(&[dim1, dim2]), vec![0]);
    }

    struct FixedSource(u32);

    impl CoverageSource for FixedSource {
        fn id(&self) -> String {
            format!("fixed_{}", self.0)
        }

        fn load(&self, chrom_list: &ChromList, bin_size: u32) -> OmnipeakResult<GenomeBins> {
            Ok(chrom_list
                .data
                .iter()
                .map(|info| {
                    vec![self.0; crate::chrom_list::get_bin_count(info.length, bin_size)]
                })
                .collect())
        }
    }

    #[test]
    fn test_coverage_cache_reuses_loads() {
        let chrom_list =
            ChromList::from_entries(vec![("chr1".to_string(), 1000)]).unwrap();
        let mut cache = CoverageCache::new();
        let first = cache
            .get_or_load(&FixedSource(7), &chrom_list, 100)
            .unwrap();
        let second = cache
            .get_or_load(&FixedSource(7), &chrom_list, 100)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first[0], vec![7; 10]);
    }
}
