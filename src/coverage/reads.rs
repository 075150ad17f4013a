//! Read-based coverage: 5' positions of decoded alignments or BED intervals
//!

use std::collections::HashSet;
use std::io::Read as IoRead;

use camino::Utf8PathBuf;
use log::info;
use rust_htslib::bam::{self, Read};

use super::{CoverageFormat, CoverageSource, GenomeBins};
use crate::chrom_list::{get_bin_count, get_bin_index, ChromList};
use crate::error::{OmnipeakError, OmnipeakResult};

/// Coverage source counting one 5' read position per bin
///
#[derive(Clone)]
pub struct ReadCoverageSource {
    pub path: Utf8PathBuf,
    pub format: CoverageFormat,
    /// Reads are shifted by half the fragment size toward their 3' end
    pub fragment: Option<u32>,
    /// Count at most one read per genomic position per strand
    pub unique: bool,
}

impl ReadCoverageSource {
    pub fn new(
        path: Utf8PathBuf,
        format: CoverageFormat,
        fragment: Option<u32>,
        unique: bool,
    ) -> Self {
        assert!(matches!(
            format,
            CoverageFormat::Reads | CoverageFormat::Bed
        ));
        Self {
            path,
            format,
            fragment,
            unique,
        }
    }

    fn shift(&self) -> i64 {
        self.fragment.unwrap_or(0) as i64 / 2
    }

    /// Add one read's shifted 5' position into the bin counts
    ///
    fn count_read(
        &self,
        bins: &mut GenomeBins,
        seen: &mut HashSet<(usize, i64, bool)>,
        chrom_index: usize,
        five_prime: i64,
        reverse: bool,
        bin_size: u32,
    ) {
        if self.unique && !seen.insert((chrom_index, five_prime, reverse)) {
            return;
        }
        let pos = if reverse {
            five_prime - self.shift()
        } else {
            five_prime + self.shift()
        };
        let chrom_bins = &mut bins[chrom_index];
        if pos < 0 {
            return;
        }
        let bin = get_bin_index(pos as u64, bin_size);
        if bin < chrom_bins.len() {
            chrom_bins[bin] += 1;
        }
    }

    fn load_alignments(
        &self,
        chrom_list: &ChromList,
        bin_size: u32,
        bins: &mut GenomeBins,
    ) -> OmnipeakResult<()> {
        let mut reader = bam::Reader::from_path(&self.path).map_err(|e| {
            OmnipeakError::Input(format!(
                "unable to open alignment file '{}': {e}",
                self.path
            ))
        })?;

        // Map htslib target ids onto the canonical chromosome order
        let tid_to_chrom = reader
            .header()
            .target_names()
            .iter()
            .map(|name| {
                std::str::from_utf8(name)
                    .ok()
                    .and_then(|name| chrom_list.chrom_index(name))
            })
            .collect::<Vec<_>>();

        let mut seen = HashSet::new();
        let mut record = bam::Record::new();
        while let Some(result) = reader.read(&mut record) {
            result.map_err(|e| {
                OmnipeakError::Input(format!(
                    "failed to parse alignment record in '{}': {e}",
                    self.path
                ))
            })?;
            if filter_out_alignment_record(&record) {
                continue;
            }
            let chrom_index = match tid_to_chrom.get(record.tid() as usize) {
                Some(Some(chrom_index)) => *chrom_index,
                _ => continue,
            };
            let reverse = record.is_reverse();
            let five_prime = if reverse {
                record.cigar().end_pos() - 1
            } else {
                record.pos()
            };
            self.count_read(bins, &mut seen, chrom_index, five_prime, reverse, bin_size);
        }
        Ok(())
    }

    fn load_bed(
        &self,
        chrom_list: &ChromList,
        bin_size: u32,
        bins: &mut GenomeBins,
    ) -> OmnipeakResult<()> {
        use rust_htslib::bgzf;

        let mut reader = bgzf::Reader::from_path(&self.path).map_err(|e| {
            OmnipeakError::Input(format!("unable to open reads file '{}': {e}", self.path))
        })?;
        let mut content = String::new();
        reader.read_to_string(&mut content).map_err(|e| {
            OmnipeakError::Input(format!(
                "can't parse text from reads file '{}': {e}",
                self.path
            ))
        })?;

        let mut seen = HashSet::new();
        for (line_index, line) in content.split('\n').enumerate() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let words = line.split('\t').collect::<Vec<_>>();
            let fields = (
                words.first().copied(),
                words.get(1).and_then(|w| w.parse::<i64>().ok()),
                words.get(2).and_then(|w| w.parse::<i64>().ok()),
            );
            let (chrom, start, end) = match fields {
                (Some(chrom), Some(start), Some(end)) if start < end => (chrom, start, end),
                _ => {
                    return Err(OmnipeakError::Input(format!(
                        "malformed bed record at line {} of '{}'",
                        line_index + 1,
                        self.path
                    )));
                }
            };
            let chrom_index = match chrom_list.chrom_index(chrom) {
                Some(chrom_index) => chrom_index,
                None => continue,
            };
            let reverse = words.get(5).copied() == Some("-");
            let five_prime = if reverse { end - 1 } else { start };
            self.count_read(bins, &mut seen, chrom_index, five_prime, reverse, bin_size);
        }
        Ok(())
    }
}

impl CoverageSource for ReadCoverageSource {
    fn id(&self) -> String {
        let stem = self.path.file_stem().unwrap_or("reads");
        let mut id = stem.to_string();
        if let Some(fragment) = self.fragment {
            id.push_str(&format!("_{fragment}"));
        }
        if self.unique {
            id.push_str("_unique");
        }
        id
    }

    fn load(&self, chrom_list: &ChromList, bin_size: u32) -> OmnipeakResult<GenomeBins> {
        info!("Reading coverage from file '{}'", self.path);
        let mut bins = chrom_list
            .data
            .iter()
            .map(|info| vec![0u32; get_bin_count(info.length, bin_size)])
            .collect::<GenomeBins>();
        match self.format {
            CoverageFormat::Reads => self.load_alignments(chrom_list, bin_size, &mut bins)?,
            CoverageFormat::Bed => self.load_bed(chrom_list, bin_size, &mut bins)?,
            CoverageFormat::BigWig => unreachable!(),
        }
        Ok(bins)
    }
}

/// Filter alignment records that never contribute coverage evidence
///
fn filter_out_alignment_record(record: &bam::Record) -> bool {
    record.is_unmapped()
        || record.is_secondary()
        || record.is_supplementary()
        || record.is_duplicate()
        || record.is_quality_check_failed()
        || record.tid() < 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chrom_list() -> ChromList {
        ChromList::from_entries(vec![("chr1".to_string(), 1000)]).unwrap()
    }

    fn write_bed(name: &str, content: &str) -> Utf8PathBuf {
        let dir = std::env::temp_dir().join("omnipeak_reads_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.join(name)).unwrap();
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_bed_five_prime_counting() {
        let path = write_bed(
            "five_prime.bed",
            "chr1\t10\t80\tr1\t0\t+\nchr1\t150\t260\tr2\t0\t-\nchr1\t110\t190\tr3\t0\t+\n",
        );
        let source =
            ReadCoverageSource::new(path, CoverageFormat::Bed, None, false);
        let bins = source.load(&test_chrom_list(), 100).unwrap();
        // Forward reads count at start, the reverse read at end - 1
        assert_eq!(bins[0][0], 1);
        assert_eq!(bins[0][1], 1);
        assert_eq!(bins[0][2], 1);
        assert_eq!(bins[0].iter().sum::<u32>(), 3);
    }

    #[test]
    fn test_bed_unique_filter() {
        let content = "chr1\t10\t80\tr1\t0\t+\nchr1\t10\t90\tr2\t0\t+\nchr1\t10\t90\tr3\t0\t-\n";
        let path = write_bed("unique.bed", content);

        let all =
            ReadCoverageSource::new(path.clone(), CoverageFormat::Bed, None, false);
        assert_eq!(all.load(&test_chrom_list(), 100).unwrap()[0][0], 3);

        // Two reads share the forward 5' position 10; the reverse read has
        // its own position and strand
        let unique = ReadCoverageSource::new(path, CoverageFormat::Bed, None, true);
        let bins = unique.load(&test_chrom_list(), 100).unwrap();
        assert_eq!(bins[0][0], 2);
    }

    #[test]
    fn test_bed_fragment_shift() {
        let path = write_bed("shift.bed", "chr1\t10\t80\tr1\t0\t+\nchr1\t600\t700\tr2\t0\t-\n");
        let source =
            ReadCoverageSource::new(path, CoverageFormat::Bed, Some(200), false);
        let bins = source.load(&test_chrom_list(), 100).unwrap();
        // Forward: 10 + 100 -> bin 1; reverse: 699 - 100 -> bin 5
        assert_eq!(bins[0][1], 1);
        assert_eq!(bins[0][5], 1);
        assert_eq!(bins[0].iter().sum::<u32>(), 2);
    }

    #[test]
    fn test_unknown_chromosome_skipped() {
        let path = write_bed("unknown.bed", "chrZ\t10\t80\tr1\t0\t+\nchr1\t10\t80\tr2\t0\t+\n");
        let source =
            ReadCoverageSource::new(path, CoverageFormat::Bed, None, false);
        let bins = source.load(&test_chrom_list(), 100).unwrap();
        assert_eq!(bins[0].iter().sum::<u32>(), 1);
    }

    #[test]
    fn test_id_reflects_settings() {
        let source = ReadCoverageSource::new(
            Utf8PathBuf::from("/data/sample1.bed"),
            CoverageFormat::Bed,
            Some(150),
            true,
        );
        assert_eq!(source.id(), "sample1_150_unique");
    }
}
