//! Final peak records and their BED6+3 serialization
//!

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};

use camino::Utf8Path;
use log::info;

use crate::error::{OmnipeakError, OmnipeakResult};

/// One called peak in base coordinates
///
/// Value objects: peaks carry no references into posterior storage.
///
#[derive(Clone, Debug, PartialEq)]
pub struct Peak {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
    pub name: String,
    /// Integer display score in [0, 1000]
    pub score: u32,
    /// Fold enrichment or model-based value
    pub value: f64,
    pub minus_log10_p: f64,
    pub minus_log10_q: f64,
}

impl Peak {
    /// The BED score field: -log10(q) truncated into [0, 1000]
    ///
    pub fn display_score(minus_log10_q: f64) -> u32 {
        minus_log10_q.max(0.0).min(1000.0) as u32
    }
}

/// Sort peaks by (chromosome name, start, end) and assign 1-based names
///
pub fn sort_and_name_peaks(peaks: &mut [Peak], name_prefix: &str) {
    peaks.sort_by(|a, b| {
        (a.chrom.as_str(), a.start, a.end).cmp(&(b.chrom.as_str(), b.start, b.end))
    });
    for (index, peak) in peaks.iter_mut().enumerate() {
        peak.name = format!("{}_{}", name_prefix, index + 1);
    }
}

/// Write peaks as tab-separated BED6+3
///
/// Columns: chrom, start, end, name, score, strand ('.'), value,
/// -log10(p), -log10(q). Numeric fields use the invariant locale.
///
pub fn write_peaks_bed(filename: &Utf8Path, peaks: &[Peak]) -> OmnipeakResult<()> {
    info!("Writing {} peak(s) to file: '{}'", peaks.len(), filename);

    let file =
        File::create(filename).map_err(|e| OmnipeakError::io(filename.to_owned(), e))?;
    let mut writer = BufWriter::new(file);
    for peak in peaks.iter() {
        writeln!(
            writer,
            "{}\t{}\t{}\t{}\t{}\t.\t{}\t{}\t{}",
            peak.chrom,
            peak.start,
            peak.end,
            peak.name,
            peak.score,
            peak.value,
            peak.minus_log10_p,
            peak.minus_log10_q,
        )
        .map_err(|e| OmnipeakError::io(filename.to_owned(), e))?;
    }
    writer
        .flush()
        .map_err(|e| OmnipeakError::io(filename.to_owned(), e))
}

/// Parse a BED6+3 peak file written by `write_peaks_bed`
///
#[allow(dead_code)]
pub fn read_peaks_bed(filename: &Utf8Path) -> OmnipeakResult<Vec<Peak>> {
    let file =
        File::open(filename).map_err(|e| OmnipeakError::io(filename.to_owned(), e))?;
    let reader = BufReader::new(file);

    let mut peaks = Vec::new();
    for (line_index, line) in reader.lines().enumerate() {
        let line = line.map_err(|e| OmnipeakError::io(filename.to_owned(), e))?;
        if line.is_empty() {
            continue;
        }
        let words = line.split('\t').collect::<Vec<_>>();
        if words.len() != 9 {
            return Err(OmnipeakError::Input(format!(
                "expected 9 BED6+3 columns at line {} of '{}', found {}",
                line_index + 1,
                filename,
                words.len()
            )));
        }
        let parse_error = |what: &str| {
            OmnipeakError::Input(format!(
                "malformed {} at line {} of '{}'",
                what,
                line_index + 1,
                filename
            ))
        };
        peaks.push(Peak {
            chrom: words[0].to_string(),
            start: words[1].parse().map_err(|_| parse_error("start"))?,
            end: words[2].parse().map_err(|_| parse_error("end"))?,
            name: words[3].to_string(),
            score: words[4].parse().map_err(|_| parse_error("score"))?,
            value: words[6].parse().map_err(|_| parse_error("value"))?,
            minus_log10_p: words[7].parse().map_err(|_| parse_error("p column"))?,
            minus_log10_q: words[8].parse().map_err(|_| parse_error("q column"))?,
        });
    }
    Ok(peaks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_peaks() -> Vec<Peak> {
        vec![
            Peak {
                chrom: "chr2".to_string(),
                start: 100,
                end: 500,
                name: String::new(),
                score: 77,
                value: 3.5714285714285716,
                minus_log10_p: 12.25,
                minus_log10_q: 7.75,
            },
            Peak {
                chrom: "chr1".to_string(),
                start: 9000,
                end: 9400,
                name: String::new(),
                score: 1000,
                value: 1250.0,
                minus_log10_p: 2000.5,
                minus_log10_q: 1999.125,
            },
            Peak {
                chrom: "chr1".to_string(),
                start: 200,
                end: 600,
                name: String::new(),
                score: 0,
                value: 0.033,
                minus_log10_p: 0.5,
                minus_log10_q: 0.1,
            },
        ]
    }

    #[test]
    fn test_sort_and_name() {
        let mut peaks = test_peaks();
        sort_and_name_peaks(&mut peaks, "peak");
        let order = peaks
            .iter()
            .map(|p| (p.chrom.as_str(), p.start))
            .collect::<Vec<_>>();
        assert_eq!(
            order,
            vec![("chr1", 200), ("chr1", 9000), ("chr2", 100)]
        );
        assert_eq!(peaks[0].name, "peak_1");
        assert_eq!(peaks[2].name, "peak_3");
    }

    #[test]
    fn test_display_score_range() {
        assert_eq!(Peak::display_score(-3.0), 0);
        assert_eq!(Peak::display_score(0.4), 0);
        assert_eq!(Peak::display_score(7.9), 7);
        assert_eq!(Peak::display_score(1000.0), 1000);
        assert_eq!(Peak::display_score(123456.0), 1000);
    }

    #[test]
    fn test_bed_round_trip() {
        let dir = std::env::temp_dir().join("omnipeak_peaks_test");
        std::fs::create_dir_all(&dir).unwrap();
        let filename =
            camino::Utf8PathBuf::from_path_buf(dir.join("roundtrip.peak")).unwrap();

        let mut peaks = test_peaks();
        sort_and_name_peaks(&mut peaks, "testprefix");
        write_peaks_bed(&filename, &peaks).unwrap();
        let reread = read_peaks_bed(&filename).unwrap();
        assert_eq!(peaks, reread);

        std::fs::remove_file(&filename).unwrap();
    }

    #[test]
    fn test_read_rejects_malformed() {
        let dir = std::env::temp_dir().join("omnipeak_peaks_test");
        std::fs::create_dir_all(&dir).unwrap();
        let filename =
            camino::Utf8PathBuf::from_path_buf(dir.join("malformed.peak")).unwrap();
        std::fs::write(&filename, "chr1\t10\t20\n").unwrap();
        assert!(matches!(
            read_peaks_bed(&filename),
            Err(OmnipeakError::Input(_))
        ));
        std::fs::remove_file(&filename).unwrap();
    }
}
