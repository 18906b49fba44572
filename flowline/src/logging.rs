//! Logging setup for the driver binary.

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins when set;
/// otherwise `--verbose` selects debug level and the default is info.
pub fn init(verbose: bool) {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
