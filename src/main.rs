mod analyze;
mod bigwig_utils;
mod candidates;
mod chrom_list;
mod cli;
mod clipping;
mod coverage;
mod engine;
mod error;
mod fit_store;
mod genome_regions;
mod hmm;
mod int_range;
mod logger;
mod multiple_testing;
mod peaks;
mod scoring;
mod sensitivity;
mod stats_util;
mod summits;

use std::error::Error;

use hhmmss::Hhmmss;
use log::info;

use crate::analyze::run_analyze;
use crate::cli::Commands;
use crate::logger::{setup_output_dir_and_logger, PROGRAM_NAME};

fn run(settings: &cli::Settings) -> Result<(), Box<dyn Error>> {
    info!(
        "Starting {PROGRAM_NAME} {}",
        env!("CARGO_PKG_VERSION")
    );
    info!(
        "cmdline: {}",
        std::env::args().collect::<Vec<_>>().join(" ")
    );
    info!("Running on {} threads", settings.shared.thread_count);

    let start = std::time::Instant::now();

    match &settings.command {
        Commands::Analyze(x) => {
            run_analyze(&settings.shared, x);
        }
    }

    info!(
        "{PROGRAM_NAME} completed. Total Runtime: {}",
        start.elapsed().hhmmssxxx()
    );
    Ok(())
}

fn main() {
    let settings = cli::parse_settings();

    // Validation of output_dir needs to be handled separately so that we
    // don't log error messages before logging is setup.
    setup_output_dir_and_logger(
        settings.get_output_dir(),
        settings.shared.clobber,
        settings.shared.debug,
    );

    let settings = cli::validate_and_fix_settings(settings);

    if let Err(err) = run(&settings) {
        eprintln!("{}", err);
        std::process::exit(2);
    }
}
