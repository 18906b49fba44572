//! The flowline command-line driver: parses arguments, sets up logging and
//! runs one or more workflow configurations in sequence, each consuming
//! the previous run's output.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod logging;
pub mod run;

use std::path::PathBuf;

/// Environment variable forcing single-worker mode regardless of
/// `--workers`.
pub const NOMPI_ENV: &str = "FLOWLINE_NOMPI";

/// Command-line surface of the driver.
#[derive(Debug, clap::Parser)]
#[clap(
    name = "flowline",
    about = "Run chunked workflows over a shared binary data container",
    version
)]
pub struct Config {
    /// Workflow files, run in sequence; each subsequent workflow consumes
    /// the previous output as its input.
    #[clap(
        long = "configs",
        short = 'c',
        required = true,
        multiple_values = true,
        min_values = 1
    )]
    pub configs: Vec<PathBuf>,

    /// Input container to loop over; optional when the first workflow uses
    /// a custom generator that produces its own source.
    #[clap(long = "input_filename", short = 'i')]
    pub input_filename: Option<PathBuf>,

    /// Output container path shared by every workflow in the sequence.
    #[clap(long = "output_filename", short = 'o')]
    pub output_filename: PathBuf,

    /// First source row to process (for partial-file processing).
    #[clap(long = "start_position", short = 's')]
    pub start_position: Option<u64>,

    /// One past the last source row to process.
    #[clap(long = "end_position", short = 'e')]
    pub end_position: Option<u64>,

    /// Additional paths to drop from the output, merged with each
    /// workflow's own drop-list.
    #[clap(long = "drop", multiple_values = true)]
    pub drop: Vec<String>,

    /// Number of peer workers.
    #[clap(long = "workers", short = 'n', default_value = "1")]
    pub workers: usize,

    /// Force single-worker mode.
    #[clap(long = "nompi")]
    pub nompi: bool,

    /// Debug-level log output.
    #[clap(long = "verbose", short = 'v')]
    pub verbose: bool,
}

impl Config {
    /// Effective worker count after `--nompi` and the environment override.
    pub fn effective_workers(&self) -> usize {
        if self.nompi || std::env::var_os(NOMPI_ENV).is_some() {
            1
        } else {
            self.workers.max(1)
        }
    }
}
