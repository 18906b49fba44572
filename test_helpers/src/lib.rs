//! Shared scaffolding for tests: temporary container files and opt-in
//! logging.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use observability_deps::tracing;
use parking_lot::Once;

pub use tempfile;

/// A temporary file that is cleaned up when dropped.
pub fn tmp_file() -> std::io::Result<tempfile::NamedTempFile> {
    tempfile::Builder::new().prefix("flowline").tempfile()
}

/// A temporary directory that is cleaned up when dropped.
pub fn tmp_dir() -> std::io::Result<tempfile::TempDir> {
    tempfile::Builder::new().prefix("flowline").tempdir()
}

static LOG_SETUP: Once = Once::new();

/// Enables tracing output in tests when `RUST_LOG` is set, e.g.
/// `RUST_LOG=debug cargo test -- --nocapture`. Safe to call from every test;
/// the subscriber is installed once per process.
pub fn maybe_start_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        start_logging()
    }
}

/// Unconditionally installs the test subscriber (once per process).
pub fn start_logging() {
    LOG_SETUP.call_once(|| {
        tracing_log::LogTracer::init().expect("tracing/log bridge");
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("test subscriber");
    })
}
