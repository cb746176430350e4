//! Logging initialisation.

use tracing_subscriber::{fmt, EnvFilter};

/// Initialise the tracing subscriber.
///
/// The log level comes from `RUST_LOG` when set (for example
/// `RUST_LOG=bonus_engine=debug`), `info` otherwise.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).init();
}
