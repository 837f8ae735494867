//! Batched first-pass reconciliation.
//!
//! Once per tick the aggregator:
//! - selects never-attempted records older than the hold-back
//! - sweeps in every unprocessed record for each touched entity
//! - keeps only the newest record per (entity, event type)
//! - dispatches the survivors, most urgent type first
//! - deletes the stale duplicates

use std::cmp::Ordering;
use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use reconciler_core::{EntityId, EventType, WorkRecord};

use crate::dispatcher::Dispatcher;
use crate::pass::{OnCompleted, PassReport, ScheduledPass, abandon, attempt};
use crate::store::{MessageStore, StoreError};

/// Lock name guarding the aggregator tick.
pub const AGGREGATE_LOCK: &str = "aggregate-messages";

/// Default hold-back before first-time work becomes eligible.
pub const DEFAULT_HOLD_BACK: Duration = Duration::seconds(60);

/// Result of deduplicating and ordering a batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregationPlan {
    /// Survivors in dispatch order.
    pub to_dispatch: Vec<WorkRecord>,
    /// Stale duplicates to delete without dispatch.
    pub duplicates: Vec<WorkRecord>,
}

/// Dispatch order: priority ascending, then most recent first.
///
/// Entity and id break remaining ties so the order is total.
pub fn dispatch_order(a: &WorkRecord, b: &WorkRecord) -> Ordering {
    a.event_type
        .priority()
        .cmp(&b.event_type.priority())
        .then_with(|| b.created_date.cmp(&a.created_date))
        .then_with(|| a.entity_id.cmp(&b.entity_id))
        .then_with(|| a.id.cmp(&b.id))
}

/// Deduplicate by (entity, event type) and order the survivors.
///
/// Within a group the record with the latest `created_date` wins; the id
/// breaks exact ties so the outcome doesn't depend on input order.
pub fn plan_batch(records: impl IntoIterator<Item = WorkRecord>) -> AggregationPlan {
    let mut newest: HashMap<(EntityId, EventType), WorkRecord> = HashMap::new();
    let mut duplicates = Vec::new();

    for record in records {
        match newest.entry((record.entity_id, record.event_type.clone())) {
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
            Entry::Occupied(mut slot) => {
                let current = slot.get_mut();
                if (record.created_date, record.id) > (current.created_date, current.id) {
                    duplicates.push(std::mem::replace(current, record));
                } else {
                    duplicates.push(record);
                }
            }
        }
    }

    let mut to_dispatch: Vec<WorkRecord> = newest.into_values().collect();
    to_dispatch.sort_by(dispatch_order);
    duplicates.sort_by(dispatch_order);

    AggregationPlan {
        to_dispatch,
        duplicates,
    }
}

/// First-pass reconciliation over never-attempted work.
#[derive(Debug)]
pub struct Aggregator<S> {
    store: S,
    dispatcher: Arc<Dispatcher>,
    hold_back: Duration,
}

impl<S> Aggregator<S>
where
    S: MessageStore,
{
    pub fn new(store: S, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            hold_back: DEFAULT_HOLD_BACK,
        }
    }

    pub fn with_hold_back(mut self, hold_back: Duration) -> Self {
        self.hold_back = hold_back;
        self
    }

    pub fn hold_back(&self) -> Duration {
        self.hold_back
    }

    /// Collect the batch: every unprocessed record of every entity with
    /// first-time work older than the hold-back.
    fn collect_batch(
        &self,
        now: DateTime<Utc>,
        report: &mut PassReport,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        let Some(cutoff) = now.checked_sub_signed(self.hold_back) else {
            warn!(
                hold_back_secs = self.hold_back.num_seconds(),
                "hold-back reaches past the earliest timestamp; nothing is eligible"
            );
            return Ok(Vec::new());
        };
        let ready = self.store.find_unattempted_created_before(cutoff)?;

        let entities: BTreeSet<EntityId> = ready.iter().map(|r| r.entity_id).collect();
        let mut batch = Vec::new();
        for entity_id in entities {
            match self.store.find_unprocessed_by_entity(entity_id) {
                Ok(records) => batch.extend(records),
                Err(e) => {
                    report.store_errors += 1;
                    warn!(%entity_id, error = %e, "failed to load entity records; skipping entity");
                }
            }
        }
        Ok(batch)
    }
}

impl<S> ScheduledPass for Aggregator<S>
where
    S: MessageStore,
{
    fn name(&self) -> &str {
        AGGREGATE_LOCK
    }

    fn run_at(&self, now: DateTime<Utc>) -> Result<PassReport, StoreError> {
        let mut report = PassReport::default();

        let batch = self.collect_batch(now, &mut report).map_err(|e| {
            error!(error = %e, "aggregator could not select candidates");
            e
        })?;
        if batch.is_empty() {
            return Ok(report);
        }

        let plan = plan_batch(batch);
        report.selected = plan.to_dispatch.len() + plan.duplicates.len();

        for record in plan.to_dispatch {
            if record.is_expired(now) {
                abandon(AGGREGATE_LOCK, &self.store, &record, &mut report);
                continue;
            }
            attempt(
                AGGREGATE_LOCK,
                &self.store,
                &self.dispatcher,
                record,
                OnCompleted::MarkProcessed,
                now,
                &mut report,
            );
        }

        for duplicate in &plan.duplicates {
            debug!(
                id = %duplicate.id,
                entity_id = %duplicate.entity_id,
                event_type = %duplicate.event_type,
                "discarding stale duplicate"
            );
            match self.store.delete(duplicate) {
                Ok(()) => report.discarded += 1,
                Err(e) => {
                    report.store_errors += 1;
                    warn!(id = %duplicate.id, error = %e, "failed to delete duplicate");
                }
            }
        }

        info!(
            selected = report.selected,
            dispatched = report.dispatched,
            completed = report.completed,
            retried = report.retried + report.errored,
            discarded = report.discarded,
            abandoned = report.abandoned,
            "aggregation pass finished"
        );
        Ok(report)
    }
}
