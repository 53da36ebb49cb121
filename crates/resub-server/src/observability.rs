//! Tracing setup.
//!
//! The filter sits behind a reload layer so `logging.level` from the loaded
//! config can replace the bootstrap level. `RUST_LOG` always wins.

use std::sync::OnceLock;

use tracing_subscriber::{EnvFilter, Registry, fmt, prelude::*, reload};

static FILTER_HANDLE: OnceLock<reload::Handle<EnvFilter, Registry>> = OnceLock::new();

// Transport crates are chatty at debug; keep them at warn unless asked for.
const QUIET_DEPENDENCIES: &[&str] = &["hyper=warn", "tungstenite=warn", "redis=warn"];

pub fn init_tracing() {
    init_tracing_with_level("info");
}

pub fn init_tracing_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(level));

    let (reload_layer, handle) = reload::Layer::new(filter);
    let _ = FILTER_HANDLE.set(handle);

    let _ = tracing_subscriber::registry()
        .with(reload_layer)
        .with(fmt::layer().with_target(true))
        .try_init();
}

/// Swap the active filter. Ignored while `RUST_LOG` is set.
pub fn apply_logging_level(level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    let Some(handle) = FILTER_HANDLE.get() else {
        return;
    };
    match handle.modify(|filter| *filter = level_filter(level)) {
        Ok(()) => tracing::debug!(level, "Log level applied"),
        Err(e) => tracing::warn!(level, error = %e, "Failed to apply log level"),
    }
}

/// Build a filter for `level`, falling back to `info` on an unparsable value.
fn level_filter(level: &str) -> EnvFilter {
    let directives = std::iter::once(level)
        .chain(QUIET_DEPENDENCIES.iter().copied())
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::try_new(&directives).unwrap_or_else(|e| {
        eprintln!("Invalid log level `{level}` ({e}), using info");
        EnvFilter::new("info")
    })
}
