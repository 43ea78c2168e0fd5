//! Logging infrastructure.
//!
//! Every component logs through `tracing`; this module installs the subscriber
//! once at process start.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding a filter directive (falls back to `RUST_LOG`).
pub const LOG_ENV: &str = "STACKFORM_LOG";

/// Build the filter for the requested verbosity.
///
/// `verbose` forces `debug` for stackform crates; otherwise `STACKFORM_LOG`,
/// then `RUST_LOG`, then `info`.
pub fn filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("info,stackform_core=debug,stackform=debug");
    }
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize the global subscriber, writing to stderr.
///
/// Returns an error if a global subscriber was already installed.
pub fn init(verbose: bool) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(verbose)
                .with_level(true),
        )
        .try_init()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbose_filter_enables_debug() {
        let filter = filter(true).to_string();
        assert!(filter.contains("stackform_core=debug"));
    }
}
