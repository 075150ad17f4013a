use std::collections::HashMap;

use bio::data_structures::interval_tree::IntervalTree;
use camino::Utf8Path;
use log::info;

use crate::error::{OmnipeakError, OmnipeakResult};

/// A set of chromosome regions which can be efficiently queried
///
#[derive(Clone)]
pub struct ChromRegions {
    regions: IntervalTree<i64, ()>,
}

impl ChromRegions {
    pub fn new() -> Self {
        Self {
            regions: IntervalTree::new(),
        }
    }

    /// Return true if the start-end range intersects with any regions stored in this object
    ///
    pub fn intersect(&self, start: i64, end: i64) -> bool {
        self.regions.find(start..end).next().is_some()
    }

    /// Adds a region, regions are not collapsed
    ///
    pub fn add_region(&mut self, start: i64, end: i64) {
        self.regions.insert(start..end, ());
    }
}

/// Genome region set with by-chromosome lookup, used for blacklist filtering
///
#[derive(Clone, Default)]
pub struct GenomeRegions {
    pub chroms: HashMap<String, ChromRegions>,
}

impl GenomeRegions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create new object from bed file
    ///
    /// # Arguments
    ///
    /// * `label` - Used in error messages to describe what type of regions file this is
    ///
    pub fn from_bed(filename: &Utf8Path, label: &str) -> OmnipeakResult<Self> {
        use rust_htslib::bgzf;
        use std::io::Read;

        info!("Reading {label} regions from file '{filename}'");

        let mut regions = GenomeRegions::new();
        let mut reader = bgzf::Reader::from_path(filename).map_err(|e| {
            OmnipeakError::Input(format!(
                "unable to open {label} regions file '{filename}': {e}"
            ))
        })?;

        let mut content = String::new();
        reader.read_to_string(&mut content).map_err(|e| {
            OmnipeakError::Input(format!(
                "can't parse text from {label} regions file '{filename}': {e}"
            ))
        })?;

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
            match fields {
                (Some(chrom), Some(start), Some(end)) if start < end => {
                    regions.add_region(chrom, start, end);
                }
                _ => {
                    return Err(OmnipeakError::Input(format!(
                        "malformed bed record at line {} of {label} regions file '{filename}'",
                        line_index + 1
                    )));
                }
            }
        }

        Ok(regions)
    }

    pub fn is_empty(&self) -> bool {
        self.chroms.is_empty()
    }

    pub fn add_region(&mut self, chrom: &str, start: i64, end: i64) {
        self.chroms
            .entry(chrom.to_string())
            .or_insert_with(ChromRegions::new)
            .add_region(start, end);
    }

    /// Return true if the range intersects any region on the named chromosome
    ///
    pub fn intersect(&self, chrom: &str, start: i64, end: i64) -> bool {
        match self.chroms.get(chrom) {
            Some(chrom_regions) => chrom_regions.intersect(start, end),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intersect() {
        let mut regions = GenomeRegions::new();
        regions.add_region("chr1", 100, 200);
        regions.add_region("chr1", 500, 600);
        regions.add_region("chr2", 0, 50);

        assert!(regions.intersect("chr1", 150, 160));
        assert!(regions.intersect("chr1", 199, 300));
        assert!(!regions.intersect("chr1", 200, 500));
        assert!(regions.intersect("chr2", 49, 1000));
        assert!(!regions.intersect("chr3", 0, 1000));
    }
}
