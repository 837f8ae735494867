use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use reconciler_core::{EntityId, EventType, MessageId, WorkRecord};

/// Inclusive band of `retry_count` values; `max = None` is unbounded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct RetryBand {
    pub min: u32,
    pub max: Option<u32>,
}

impl RetryBand {
    pub const fn new(min: u32, max: u32) -> Self {
        Self {
            min,
            max: Some(max),
        }
    }

    pub const fn at_least(min: u32) -> Self {
        Self { min, max: None }
    }

    pub fn contains(&self, retry_count: u32) -> bool {
        retry_count >= self.min && self.max.is_none_or(|max| retry_count <= max)
    }
}

impl core::fmt::Display for RetryBand {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.max {
            Some(max) => write!(f, "[{}, {}]", self.min, max),
            None => write!(f, "[{}, ∞)", self.min),
        }
    }
}

/// Work record store operation error.
///
/// These are **infrastructure errors** (storage, encoding) as opposed to
/// dispatch outcomes, which are never errors from the store's point of view.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(MessageId),

    #[error("record already exists: {0}")]
    AlreadyExists(MessageId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Durable, queryable store of reconciliation work records.
///
/// ## Contract
///
/// - Each record is independently consistent; no cross-record transactions.
/// - Writes are last-write-wins. No optimistic or pessimistic locking is
///   assumed, so overlapping passes may both mutate the same record.
/// - Queries return **unordered** sets; ordering is the caller's job.
/// - `delete` of a record that is already gone succeeds (another pass may have
///   removed it first).
pub trait MessageStore: Send + Sync {
    /// Persist a new record.
    fn insert(&self, record: &WorkRecord) -> Result<(), StoreError>;

    /// Full replace of an existing record, identified by `id`.
    fn update(&self, record: &WorkRecord) -> Result<(), StoreError>;

    /// Physically remove a record.
    fn delete(&self, record: &WorkRecord) -> Result<(), StoreError>;

    fn get(&self, id: MessageId) -> Result<Option<WorkRecord>, StoreError>;

    /// Unprocessed records for one entity, regardless of age or retry count.
    fn find_unprocessed_by_entity(&self, entity_id: EntityId)
    -> Result<Vec<WorkRecord>, StoreError>;

    /// Records of one event type at an exact retry count (processed or not).
    fn find_by_event_type_and_retry_count(
        &self,
        event_type: &EventType,
        retry_count: u32,
    ) -> Result<Vec<WorkRecord>, StoreError>;

    /// Unprocessed records whose retry count falls inside `band`.
    fn find_unprocessed_by_retry_band(&self, band: RetryBand)
    -> Result<Vec<WorkRecord>, StoreError>;

    /// Unprocessed, never-attempted records created strictly before `cutoff`.
    fn find_unattempted_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkRecord>, StoreError>;

    /// Delete every record whose expiry is at or before `now`, processed or
    /// not. Returns how many were removed.
    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;
}

impl<S> MessageStore for Arc<S>
where
    S: MessageStore + ?Sized,
{
    fn insert(&self, record: &WorkRecord) -> Result<(), StoreError> {
        (**self).insert(record)
    }

    fn update(&self, record: &WorkRecord) -> Result<(), StoreError> {
        (**self).update(record)
    }

    fn delete(&self, record: &WorkRecord) -> Result<(), StoreError> {
        (**self).delete(record)
    }

    fn get(&self, id: MessageId) -> Result<Option<WorkRecord>, StoreError> {
        (**self).get(id)
    }

    fn find_unprocessed_by_entity(
        &self,
        entity_id: EntityId,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        (**self).find_unprocessed_by_entity(entity_id)
    }

    fn find_by_event_type_and_retry_count(
        &self,
        event_type: &EventType,
        retry_count: u32,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        (**self).find_by_event_type_and_retry_count(event_type, retry_count)
    }

    fn find_unprocessed_by_retry_band(
        &self,
        band: RetryBand,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        (**self).find_unprocessed_by_retry_band(band)
    }

    fn find_unattempted_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        (**self).find_unattempted_created_before(cutoff)
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        (**self).delete_expired(now)
    }
}
