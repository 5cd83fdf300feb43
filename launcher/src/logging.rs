//! Diagnostic tracing for the launcher.
//!
//! Everything goes to stderr so stdout stays free for the run summary.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Default filter directive for `verbose`.
pub fn default_directive(verbose: bool) -> &'static str {
    if verbose { "debug" } else { "info" }
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `--verbose` selects `debug` over `info`.
///
/// ```bash
/// RUST_LOG=launcher=trace launch -c launch.toml
/// ```
pub fn init(verbose: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .init();
}
