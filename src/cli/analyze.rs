use camino::Utf8PathBuf;
use clap::Args;
use const_format::concatcp;
use simple_error::{bail, SimpleResult};

use crate::coverage::CoverageFormat;
use crate::summits::DEFAULT_SUMMIT_BANDWIDTH;

#[derive(Args)]
pub struct AnalyzeSettings {
    /// Directory for all analyze command output (must not already exist)
    #[arg(long, value_name = "DIR", default_value = concatcp!(env!("CARGO_PKG_NAME"), "_analyze_output"))]
    pub output_dir: Utf8PathBuf,

    /// Treatment coverage file(s) in BAM, SAM, CRAM, BED, BED.gz or BigWig
    /// format. Multiple files are treated as replicate dimensions of one
    /// experiment.
    #[arg(long = "treatment", value_name = "FILE", required = true, num_args = 1..)]
    pub treatment_filenames: Vec<Utf8PathBuf>,

    /// Control file(s): either one per treatment file or a single file
    /// shared by all treatments
    #[arg(long = "control", value_name = "FILE", num_args = 1..)]
    pub control_filenames: Vec<Utf8PathBuf>,

    /// Chromosome sizes file with two whitespace-separated columns (name,
    /// length)
    #[arg(long = "chrom-sizes", value_name = "FILE")]
    pub chrom_sizes_filename: Utf8PathBuf,

    /// Genomic regions to exclude from peak calling, in BED format
    #[arg(long = "blacklist", value_name = "FILE")]
    pub blacklist_filename: Option<Utf8PathBuf>,

    /// Size of genome bins in bases
    #[arg(long, default_value_t = 100)]
    pub bin: u32,

    /// Target false discovery rate
    #[arg(long, default_value_t = 0.05)]
    pub fdr: f64,

    /// Sequencing fragment size; reads are shifted by half this value
    /// toward their 3' end
    #[arg(long, value_name = "SIZE")]
    pub fragment: Option<u32>,

    /// Count at most one read per genomic position per strand
    #[arg(long)]
    pub unique: bool,

    /// Keep the control track for significance testing only, without
    /// regressing it out of the treatment signal
    #[arg(long = "no-regress-control")]
    pub no_regress_control: bool,

    /// Merge candidates separated by at most this many bins. Estimated from
    /// the fragmentation curve when not given.
    #[arg(long, value_name = "BINS", allow_hyphen_values = true)]
    pub gap: Option<i64>,

    /// Log posterior error probability threshold. Estimated from the
    /// sensitivity sweep when not given.
    #[arg(long, value_name = "LOG_PEP", allow_hyphen_values = true)]
    pub sensitivity: Option<f64>,

    /// Report summit sub-ranges instead of whole enriched intervals
    #[arg(long)]
    pub summits: bool,

    /// Kernel bandwidth of the summit mode finder, in bins
    #[arg(hide = true, long, default_value_t = DEFAULT_SUMMIT_BANDWIDTH)]
    pub summit_bandwidth: usize,

    /// Weight of the candidate signal excess in the boundary clipping
    /// density ceiling. Zero disables clipping.
    #[arg(hide = true, long, default_value_t = 0.4)]
    pub clip: f64,

    /// Use the Bonferroni correction instead of Benjamini-Hochberg
    #[arg(hide = true, long)]
    pub bonferroni: bool,

    /// Force the input format instead of selecting it by file extension
    #[arg(long, value_name = "FORMAT")]
    pub format: Option<String>,

    /// Also write a counts-per-million-normalized coverage track in BigWig
    /// format, with blacklisted regions zeroed
    #[arg(long = "bigwig")]
    pub write_bigwig: bool,

    /// Prefix of emitted peak names
    #[arg(long, value_name = "PREFIX", default_value = "peak")]
    pub peaks_prefix: String,
}

impl AnalyzeSettings {
    /// The forced input format, if any
    ///
    pub fn forced_format(&self) -> Option<CoverageFormat> {
        self.format.as_deref().map(|format| match format {
            "bam" | "sam" | "cram" => CoverageFormat::Reads,
            "bed" => CoverageFormat::Bed,
            "bigwig" | "bw" => CoverageFormat::BigWig,
            // Unreachable after settings validation
            other => panic!("unsupported format '{other}'"),
        })
    }
}

/// Validate settings and update parameters that can't be processed by clap
///
pub fn validate_and_fix_analyze_settings(
    settings: AnalyzeSettings,
) -> SimpleResult<AnalyzeSettings> {
    if settings.bin == 0 {
        bail!("--bin must be greater than 0");
    }
    if !(settings.fdr > 0.0 && settings.fdr < 1.0) {
        bail!("--fdr must lie strictly between 0 and 1");
    }
    if let Some(gap) = settings.gap {
        if gap < 0 {
            bail!("--gap must not be negative");
        }
    }
    if let Some(sensitivity) = settings.sensitivity {
        if sensitivity >= 0.0 {
            bail!("--sensitivity is a log probability and must be negative");
        }
    }
    if !(0.0..=1.0).contains(&settings.clip) {
        bail!("--clip must lie in [0, 1]");
    }
    let controls = settings.control_filenames.len();
    if controls > 1 && controls != settings.treatment_filenames.len() {
        bail!(
            "{} control file(s) given for {} treatment file(s); supply one control per \
             treatment or a single shared control",
            controls,
            settings.treatment_filenames.len()
        );
    }
    if let Some(format) = settings.format.as_deref() {
        if !matches!(format, "bam" | "sam" | "cram" | "bed" | "bigwig" | "bw") {
            bail!("unrecognized --format '{}'", format);
        }
    }
    Ok(settings)
}
