//! Tracing/logging initialization.
//!
//! JSON logs with timestamps; verbosity follows `RUST_LOG` and defaults to
//! `info` for the reconciler crates with the sqlx query log kept at `warn`.

use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is unset or unparsable.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn";

/// Resolve the filter from an optional `RUST_LOG`-style directive string.
pub fn filter_from(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the JSON subscriber. Returns `false` when a global subscriber was
/// already set, in which case nothing changes.
pub fn try_init() -> bool {
    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    tracing_subscriber::fmt()
        .with_env_filter(filter_from(directives.as_deref()))
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init()
        .is_ok()
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    if !try_init() {
        ::tracing::debug!("tracing subscriber already installed");
    }
}
