//! Logging initialization
//!
//! One tracing subscriber per process. `RUST_LOG` overrides the configured
//! level when set, so a developer can turn on debug output without touching
//! the config file.

use crate::config::LoggingConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber
///
/// Safe to call more than once; later calls are no-ops. An invalid
/// configured level falls back to `info`.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
