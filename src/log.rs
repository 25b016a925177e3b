//! Structured logging for the coordination engine.
//!
//! Components log through the `tracing` macros. Log levels:
//! - ERROR: Critical failures that prevent operations from completing
//! - WARN: Unexpected but recoverable conditions (breaker trips, cascades)
//! - INFO: High-level decisions (steal requests, consensus results)
//! - DEBUG: Detailed operation traces (task unlocks, agent scoring)
//! - TRACE: Very detailed traces (per-candidate scores, vote collection)
//!
//! Debug mode can be enabled with `init_with_debug(true)` or the
//! `TASKMESH_DEBUG=1` env var. `RUST_LOG` takes precedence over both.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Env var that switches the default filter to debug level.
pub const DEBUG_ENV_VAR: &str = "TASKMESH_DEBUG";

/// Initialize logging at the default (info) level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_debug(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(debug || env_debug())));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).compact())
        .try_init();
}

/// Check if debug mode was requested through the environment.
pub fn env_debug() -> bool {
    std::env::var(DEBUG_ENV_VAR)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

fn default_directive(debug: bool) -> &'static str {
    if debug {
        "taskmesh=debug"
    } else {
        "taskmesh=info"
    }
}
