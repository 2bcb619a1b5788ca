//! Tracing subscriber setup.
//!
//! The library only emits `tracing` events; binaries and tests decide
//! whether to install a subscriber.

use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global `fmt` subscriber.
///
/// The filter is read from `RUST_LOG` and defaults to `info`,
/// e.g. `RUST_LOG=rbc_matching=debug` for per-day summaries.
///
/// Calling this twice is harmless: the second install is ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .try_init();
}

/// Installs a debug-level subscriber that writes through the test harness.
pub fn init_test() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
