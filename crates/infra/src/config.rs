//! Configuration loading and representation.
//!
//! Every setting comes from the environment and has a default. A value that
//! is present but unparsable or out of range is an error, not a silent
//! fallback. Intervals must be non-zero.

use std::time::Duration;

use reconciler_core::DEFAULT_EXPIRY_DAYS;

use crate::aggregator::DEFAULT_HOLD_BACK;
use crate::dispatcher::DEFAULT_FAILURE_WINDOW;

/// Upper bound for the hold-back and failure window (100 years). Larger values
/// can't be subtracted from a timestamp.
pub const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Upper bound for `RECONCILER_DEFAULT_EXPIRY_DAYS`.
pub const MAX_EXPIRY_DAYS: u64 = 100 * 365;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Minimum age of never-attempted work before the aggregator takes it.
    pub hold_back: chrono::Duration,
    /// `expiry = createdDate + default_expiry` for new records.
    pub default_expiry: chrono::Duration,
    pub failure_metric_window: chrono::Duration,
    pub aggregate_interval: Duration,
    pub short_term_interval: Duration,
    pub medium_term_interval: Duration,
    pub long_term_interval: Duration,
    pub purge_interval: Duration,
    /// Lock `max_duration` for every pass.
    pub lock_max_duration: Duration,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            hold_back: DEFAULT_HOLD_BACK,
            default_expiry: chrono::Duration::days(DEFAULT_EXPIRY_DAYS),
            failure_metric_window: DEFAULT_FAILURE_WINDOW,
            aggregate_interval: Duration::from_secs(60),
            short_term_interval: Duration::from_secs(10 * 60),
            medium_term_interval: Duration::from_secs(60 * 60),
            long_term_interval: Duration::from_secs(6 * 60 * 60),
            purge_interval: Duration::from_secs(60 * 60),
            lock_max_duration: Duration::from_secs(30 * 60),
            database_url: None,
            redis_url: None,
        }
    }
}

impl ReconcilerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| -> Result<Duration, ConfigError> {
            match parse_u64(&lookup, key)? {
                None => Ok(default),
                Some(0) => Err(invalid(key, "0")),
                Some(n) => Ok(Duration::from_secs(n)),
            }
        };
        let chrono_secs =
            |key: &str, default: chrono::Duration| -> Result<chrono::Duration, ConfigError> {
                match parse_u64(&lookup, key)? {
                    None => Ok(default),
                    Some(n) if n > MAX_WINDOW_SECS => Err(invalid(key, n.to_string())),
                    Some(n) => i64::try_from(n)
                        .ok()
                        .and_then(chrono::Duration::try_seconds)
                        .ok_or_else(|| invalid(key, n.to_string())),
                }
            };

        let default_expiry = match parse_u64(&lookup, "RECONCILER_DEFAULT_EXPIRY_DAYS")? {
            None => defaults.default_expiry,
            Some(n) if n == 0 || n > MAX_EXPIRY_DAYS => {
                return Err(invalid("RECONCILER_DEFAULT_EXPIRY_DAYS", n.to_string()));
            }
            Some(n) => i64::try_from(n)
                .ok()
                .and_then(chrono::Duration::try_days)
                .ok_or_else(|| invalid("RECONCILER_DEFAULT_EXPIRY_DAYS", n.to_string()))?,
        };

        let lock_max_duration = secs("RECONCILER_LOCK_MAX_SECS", defaults.lock_max_duration)?;

        Ok(Self {
            hold_back: chrono_secs("RECONCILER_HOLD_BACK_SECS", defaults.hold_back)?,
            default_expiry,
            failure_metric_window: chrono_secs(
                "RECONCILER_FAILURE_METRIC_WINDOW_SECS",
                defaults.failure_metric_window,
            )?,
            aggregate_interval: secs(
                "RECONCILER_AGGREGATE_INTERVAL_SECS",
                defaults.aggregate_interval,
            )?,
            short_term_interval: secs(
                "RECONCILER_SHORT_TERM_INTERVAL_SECS",
                defaults.short_term_interval,
            )?,
            medium_term_interval: secs(
                "RECONCILER_MEDIUM_TERM_INTERVAL_SECS",
                defaults.medium_term_interval,
            )?,
            long_term_interval: secs(
                "RECONCILER_LONG_TERM_INTERVAL_SECS",
                defaults.long_term_interval,
            )?,
            purge_interval: secs("RECONCILER_PURGE_INTERVAL_SECS", defaults.purge_interval)?,
            lock_max_duration,
            database_url: non_empty(lookup("DATABASE_URL")),
            redis_url: non_empty(lookup("REDIS_URL")),
        })
    }
}

fn parse_u64<F>(lookup: &F, key: &str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup(key)) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| invalid(key, raw)),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn invalid(key: &str, value: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.into(),
    }
}
