//! Logging setup.
//!
//! One entry point, driven by the already-parsed CLI flags. The level
//! falls back to `RUST_LOG` and then "info" when the flag is absent;
//! JSON output is a flag, not an environment probe.

use tracing_error::ErrorLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Installs the global subscriber. Safe to call more than once (later
/// calls are no-ops), so tests and the CLI can share it.
pub fn init(level: Option<&str>, use_json: bool) {
    let filter = match level {
        Some(lvl) => EnvFilter::new(lvl),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let base = Registry::default().with(filter).with(ErrorLayer::default());

    if use_json {
        base.with(fmt::layer().json().with_target(false))
            .try_init()
            .ok();
    } else {
        base.with(fmt::layer().with_target(false).with_file(true).with_line_number(true))
            .try_init()
            .ok();
    }
}
