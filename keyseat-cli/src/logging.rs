//! Log subscriber setup.

use tracing_subscriber::EnvFilter;

/// Installs the global subscriber writing compact lines to stderr.
///
/// `RUST_LOG` is honoured; `verbose` forces `debug`. Calling it twice is
/// harmless.
pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .try_init();
}
