//! Logging setup
//!
//! Diagnostics from the patcher are emitted as `tracing` events; this installs
//! the subscriber that prints them.

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// Install a global `fmt` subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Calling this twice is
/// harmless; the second subscriber is ignored.
pub fn init(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_directive()));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .try_init();
}
