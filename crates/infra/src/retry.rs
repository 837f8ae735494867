//! Tiered retry scheduler: slow-path reconciliation for records that failed
//! at least once.
//!
//! Each tier owns a disjoint retry-count band and runs on its own cadence.
//! Together the bands cover `[1, ∞)`.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::aggregator::dispatch_order;
use crate::dispatcher::Dispatcher;
use crate::pass::{OnCompleted, PassReport, ScheduledPass, abandon, attempt};
use crate::store::{MessageStore, RetryBand, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryTier {
    /// `retryCount` in `[1, 4]`.
    ShortTerm,
    /// `retryCount` in `[5, 10]`.
    MediumTerm,
    /// `retryCount` in `[11, ∞)`.
    LongTerm,
}

impl RetryTier {
    pub const ALL: [RetryTier; 3] = [Self::ShortTerm, Self::MediumTerm, Self::LongTerm];

    pub fn band(self) -> RetryBand {
        match self {
            Self::ShortTerm => RetryBand::new(1, 4),
            Self::MediumTerm => RetryBand::new(5, 10),
            Self::LongTerm => RetryBand::at_least(11),
        }
    }

    /// Lock name guarding this tier's tick.
    pub fn lock_name(self) -> &'static str {
        match self {
            Self::ShortTerm => "retry-short-term",
            Self::MediumTerm => "retry-medium-term",
            Self::LongTerm => "retry-long-term",
        }
    }

    /// The tier responsible for a retry count; `None` for never-attempted work.
    pub fn for_retry_count(retry_count: u32) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|tier| tier.band().contains(retry_count))
    }
}

impl fmt::Display for RetryTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.lock_name())
    }
}

/// Re-drives dispatch for unprocessed records in one tier's band.
#[derive(Debug)]
pub struct RetryScheduler<S> {
    tier: RetryTier,
    store: S,
    dispatcher: Arc<Dispatcher>,
}

impl<S> RetryScheduler<S>
where
    S: MessageStore,
{
    pub fn new(tier: RetryTier, store: S, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            tier,
            store,
            dispatcher,
        }
    }

    pub fn tier(&self) -> RetryTier {
        self.tier
    }
}

impl<S> ScheduledPass for RetryScheduler<S>
where
    S: MessageStore,
{
    fn name(&self) -> &str {
        self.tier.lock_name()
    }

    fn run_at(&self, now: DateTime<Utc>) -> Result<PassReport, StoreError> {
        let tier = self.tier.lock_name();
        let mut report = PassReport::default();

        let mut records = self
            .store
            .find_unprocessed_by_retry_band(self.tier.band())
            .map_err(|e| {
                error!(tier, error = %e, "retry tier could not select candidates");
                e
            })?;
        if records.is_empty() {
            return Ok(report);
        }
        records.sort_by(dispatch_order);
        report.selected = records.len();

        for record in records {
            if record.is_expired(now) {
                abandon(tier, &self.store, &record, &mut report);
                continue;
            }
            attempt(
                tier,
                &self.store,
                &self.dispatcher,
                record,
                OnCompleted::Delete,
                now,
                &mut report,
            );
        }

        info!(
            tier,
            selected = report.selected,
            dispatched = report.dispatched,
            completed = report.completed,
            retried = report.retried + report.errored,
            abandoned = report.abandoned,
            "retry pass finished"
        );
        Ok(report)
    }
}
