//! Result of attempting to process one work record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status;

/// Outcome of dispatching a work record to its domain handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// Terminal: downstream work succeeded or was legitimately not applicable.
    Completed { status: String },
    /// Transient failure or precondition not yet met.
    ///
    /// `until` overrides the record's expiry when present.
    Retry { until: Option<DateTime<Utc>> },
}

impl DispatchOutcome {
    pub fn completed(status: impl Into<String>) -> Self {
        Self::Completed {
            status: status.into(),
        }
    }

    /// Completed with the standard `PROCESSED` label.
    pub fn processed() -> Self {
        Self::completed(status::PROCESSED)
    }

    pub fn retry() -> Self {
        Self::Retry { until: None }
    }

    pub fn retry_until(until: DateTime<Utc>) -> Self {
        Self::Retry { until: Some(until) }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}
