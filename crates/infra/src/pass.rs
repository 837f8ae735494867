//! Shared plumbing for scheduled reconciliation passes.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use reconciler_core::{DispatchOutcome, WorkRecord, status};

use crate::dispatcher::Dispatcher;
use crate::store::{MessageStore, StoreError};

/// Lock name guarding the expired-record purge.
pub const PURGE_LOCK: &str = "purge-expired";

/// Summary of a single pass. Nothing inside a pass escapes as an error;
/// per-record failures are counted here instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    /// Records the pass considered after selection.
    pub selected: usize,
    /// Dispatch attempts made (including ones that raised).
    pub dispatched: usize,
    pub completed: usize,
    pub retried: usize,
    /// Dispatch attempts whose handler raised.
    pub errored: usize,
    /// Stale duplicates deleted without dispatch.
    pub discarded: usize,
    /// Records past their expiry, deleted without dispatch.
    pub abandoned: usize,
    /// Store mutations that failed and were skipped.
    pub store_errors: usize,
}

impl PassReport {
    pub fn is_noop(&self) -> bool {
        self.dispatched == 0 && self.discarded == 0 && self.abandoned == 0
    }
}

/// A pass the scheduler can run on a timer under a named lock.
pub trait ScheduledPass: Send + Sync {
    /// Lock name; distinct per pass.
    fn name(&self) -> &str;

    /// Run one pass against the current store state.
    ///
    /// Only a failure to select candidates is returned as an error.
    fn run_at(&self, now: DateTime<Utc>) -> Result<PassReport, StoreError>;

    fn run(&self) -> Result<PassReport, StoreError> {
        self.run_at(Utc::now())
    }
}

impl<P> ScheduledPass for Arc<P>
where
    P: ScheduledPass + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run_at(&self, now: DateTime<Utc>) -> Result<PassReport, StoreError> {
        (**self).run_at(now)
    }
}

/// What a pass does with a record after a `Completed` outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnCompleted {
    /// Keep the record with `processedDate` set.
    MarkProcessed,
    /// Remove the record.
    Delete,
}

/// Dispatch one record and persist the result.
///
/// Handler errors and panics are downgraded to a retry with the `ERROR`
/// status, so one bad record never stops the rest of the batch.
pub(crate) fn attempt<S: MessageStore>(
    pass: &str,
    store: &S,
    dispatcher: &Dispatcher,
    mut record: WorkRecord,
    on_completed: OnCompleted,
    now: DateTime<Utc>,
    report: &mut PassReport,
) {
    report.dispatched += 1;

    let dispatched = panic::catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(&record, now)))
        .unwrap_or_else(|payload| {
            Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*payload)))
        });

    let persisted = match dispatched {
        Ok(DispatchOutcome::Completed { status }) => {
            report.completed += 1;
            debug!(pass, id = %record.id, %status, "dispatch completed");
            match on_completed {
                OnCompleted::Delete => store.delete(&record),
                OnCompleted::MarkProcessed => match record.mark_processed(status, now) {
                    Ok(()) => store.update(&record),
                    Err(e) => {
                        warn!(pass, id = %record.id, error = %e, "record already processed");
                        Ok(())
                    }
                },
            }
        }
        Ok(DispatchOutcome::Retry { until }) => {
            report.retried += 1;
            record.record_failure(status::RETRY, until, now);
            debug!(
                pass,
                id = %record.id,
                retry_count = record.retry_count,
                expiry = %record.expiry,
                "dispatch requested retry"
            );
            store.update(&record)
        }
        Err(e) => {
            report.errored += 1;
            warn!(
                pass,
                id = %record.id,
                event_type = %record.event_type,
                error = %e,
                "handler raised; scheduling retry"
            );
            dispatcher.record_failure(&record, now);
            record.record_failure(status::ERROR, None, now);
            store.update(&record)
        }
    };

    if let Err(e) = persisted {
        report.store_errors += 1;
        warn!(pass, id = %record.id, error = %e, "failed to persist dispatch result");
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Delete a record that ran past its expiry without succeeding.
pub(crate) fn abandon<S: MessageStore>(
    pass: &str,
    store: &S,
    record: &WorkRecord,
    report: &mut PassReport,
) {
    info!(
        pass,
        id = %record.id,
        entity_id = %record.entity_id,
        event_type = %record.event_type,
        retry_count = record.retry_count,
        "abandoning expired record"
    );
    match store.delete(record) {
        Ok(()) => report.abandoned += 1,
        Err(e) => {
            report.store_errors += 1;
            warn!(pass, id = %record.id, error = %e, "failed to delete expired record");
        }
    }
}

/// Garbage-collects every record past its expiry, processed or not.
#[derive(Debug)]
pub struct ExpiryPurge<S> {
    store: S,
}

impl<S> ExpiryPurge<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: MessageStore> ScheduledPass for ExpiryPurge<S> {
    fn name(&self) -> &str {
        PURGE_LOCK
    }

    fn run_at(&self, now: DateTime<Utc>) -> Result<PassReport, StoreError> {
        let purged = self.store.delete_expired(now)?;
        if purged > 0 {
            info!(purged, "purged expired records");
        }
        Ok(PassReport {
            abandoned: purged,
            ..PassReport::default()
        })
    }
}
