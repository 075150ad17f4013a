use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::ops::Range;

use camino::Utf8Path;
use serde::{Deserialize, Serialize};

use crate::error::{OmnipeakError, OmnipeakResult};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ChromInfo {
    pub label: String,
    pub length: u64,
}

/// Ordered chromosome name and length information for one reference genome
///
/// Chromosomes are sorted by name so that every numeric layout derived from
/// the list (bin indexing, q-value vectors, output ordering) is deterministic
/// regardless of the input file order.
///
#[derive(Clone, Default)]
pub struct ChromList {
    pub data: Vec<ChromInfo>,
    pub label_to_index: HashMap<String, usize>,
}

impl ChromList {
    pub fn from_entries(entries: Vec<(String, u64)>) -> OmnipeakResult<Self> {
        let mut data = entries
            .into_iter()
            .map(|(label, length)| ChromInfo { label, length })
            .collect::<Vec<_>>();
        data.sort_by(|a, b| a.label.cmp(&b.label));

        let mut label_to_index = HashMap::new();
        for (index, info) in data.iter().enumerate() {
            if info.length == 0 {
                return Err(OmnipeakError::Input(format!(
                    "zero-length chromosome '{}'",
                    info.label
                )));
            }
            if label_to_index.insert(info.label.clone(), index).is_some() {
                return Err(OmnipeakError::Input(format!(
                    "duplicated chromosome name '{}'",
                    info.label
                )));
            }
        }
        Ok(Self {
            data,
            label_to_index,
        })
    }

    /// Read a two-column whitespace-separated chromosome sizes file
    ///
    pub fn from_chrom_sizes(filename: &Utf8Path) -> OmnipeakResult<Self> {
        let file = std::fs::File::open(filename)
            .map_err(|e| OmnipeakError::io(filename.to_owned(), e))?;
        let reader = BufReader::new(file);

        let mut entries = Vec::new();
        for (line_index, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| OmnipeakError::io(filename.to_owned(), e))?;
            if line.trim().is_empty() {
                continue;
            }
            let mut words = line.split_whitespace();
            let label = words.next();
            let length = words.next().and_then(|w| w.parse::<u64>().ok());
            match (label, length) {
                (Some(label), Some(length)) => entries.push((label.to_string(), length)),
                _ => {
                    return Err(OmnipeakError::Input(format!(
                        "malformed chromosome sizes line {} in '{}': '{}'",
                        line_index + 1,
                        filename,
                        line
                    )));
                }
            }
        }
        if entries.is_empty() {
            return Err(OmnipeakError::Input(format!(
                "no chromosomes found in '{filename}'"
            )));
        }
        Self::from_entries(entries)
    }

    pub fn chrom_index(&self, label: &str) -> Option<usize> {
        self.label_to_index.get(label).copied()
    }

    pub fn chrom_count(&self) -> usize {
        self.data.len()
    }

    /// Chromosome sizes as (name, length) pairs in canonical order
    ///
    pub fn to_entries(&self) -> Vec<(String, u64)> {
        self.data
            .iter()
            .map(|info| (info.label.clone(), info.length))
            .collect()
    }
}

/// Return the number of bins of size `bin_size` covering `total_size`
///
/// Any incomplete bin at the end of the chromosome is included
///
pub fn get_bin_count(total_size: u64, bin_size: u32) -> usize {
    total_size.div_ceil(bin_size as u64) as usize
}

/// Return the zero-indexed bin number of position `pos` given bins of size `bin_size`
///
pub fn get_bin_index(pos: u64, bin_size: u32) -> usize {
    (pos / bin_size as u64) as usize
}

/// Per-chromosome offsets into the concatenated genome bin vector
///
#[derive(Clone)]
pub struct BinIndex {
    offsets: Vec<usize>,
}

impl BinIndex {
    pub fn new(chrom_list: &ChromList, bin_size: u32) -> Self {
        assert!(bin_size > 0);
        let mut offsets = Vec::with_capacity(chrom_list.data.len() + 1);
        offsets.push(0);
        for info in chrom_list.data.iter() {
            let last = *offsets.last().unwrap();
            offsets.push(last + get_bin_count(info.length, bin_size));
        }
        Self { offsets }
    }

    pub fn bin_count(&self, chrom_index: usize) -> usize {
        self.genome_bin_range(chrom_index).len()
    }

    pub fn total_bins(&self) -> usize {
        *self.offsets.last().unwrap()
    }

    /// Bin range of one chromosome within the concatenated genome vector
    ///
    pub fn genome_bin_range(&self, chrom_index: usize) -> Range<usize> {
        self.offsets[chrom_index]..self.offsets[chrom_index + 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_chrom_list() -> ChromList {
        ChromList::from_entries(vec![
            ("chr2".to_string(), 1000),
            ("chr1".to_string(), 1050),
            ("chr3".to_string(), 199),
        ])
        .unwrap()
    }

    #[test]
    fn test_chrom_list_sorted_by_name() {
        let chrom_list = test_chrom_list();
        let labels = chrom_list
            .data
            .iter()
            .map(|info| info.label.as_str())
            .collect::<Vec<_>>();
        assert_eq!(labels, vec!["chr1", "chr2", "chr3"]);
        assert_eq!(chrom_list.chrom_index("chr2"), Some(1));
        assert_eq!(chrom_list.chrom_index("chrMissing"), None);
    }

    #[test]
    fn test_zero_length_chromosome_rejected() {
        let result = ChromList::from_entries(vec![("chr1".to_string(), 0)]);
        assert!(matches!(result, Err(OmnipeakError::Input(_))));
    }

    #[test]
    fn test_duplicate_chromosome_rejected() {
        let result = ChromList::from_entries(vec![
            ("chr1".to_string(), 10),
            ("chr1".to_string(), 20),
        ]);
        assert!(matches!(result, Err(OmnipeakError::Input(_))));
    }

    #[test]
    fn test_bin_count() {
        assert_eq!(get_bin_count(1000, 100), 10);
        assert_eq!(get_bin_count(1050, 100), 11);
        assert_eq!(get_bin_count(199, 200), 1);
        assert_eq!(get_bin_index(199, 100), 1);
        assert_eq!(get_bin_index(200, 100), 2);
    }

    #[test]
    fn test_bin_index_partitions_genome() {
        let chrom_list = test_chrom_list();
        let bin_index = BinIndex::new(&chrom_list, 100);
        assert_eq!(bin_index.bin_count(0), 11);
        assert_eq!(bin_index.bin_count(1), 10);
        assert_eq!(bin_index.bin_count(2), 2);
        assert_eq!(bin_index.total_bins(), 23);
        assert_eq!(bin_index.genome_bin_range(1), 11..21);
    }
}
