//! Logging setup.
//!
//! The subscriber is installed once at startup with a default level, before
//! the configuration file is read. The filter sits behind a reload layer so
//! `logging.level` from the loaded config can replace it afterwards. An
//! explicit `RUST_LOG` always wins over both.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

static FILTER: OnceLock<FilterHandle> = OnceLock::new();

fn rust_log_set() -> bool {
    std::env::var_os("RUST_LOG").is_some()
}

fn initial_filter(level: &str) -> EnvFilter {
    if rust_log_set() {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return filter;
        }
    }
    EnvFilter::new(level)
}

pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Install the global subscriber. Later calls are no-ops.
pub fn init_tracing_with_level(level: &str) {
    let (filter, handle) = reload::Layer::new(initial_filter(level));
    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
        .is_ok()
    {
        let _ = FILTER.set(handle);
    }
}

/// Switch to the configured level unless `RUST_LOG` is set.
pub fn apply_logging_level(level: &str) {
    if rust_log_set() {
        return;
    }
    let Some(handle) = FILTER.get() else {
        return;
    };
    if let Err(e) = handle.reload(EnvFilter::new(level)) {
        tracing::warn!(error = %e, level, "Could not apply configured log level");
    }
}
