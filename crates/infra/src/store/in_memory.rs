use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use reconciler_core::{EntityId, EventType, MessageId, WorkRecord};

use super::r#trait::{MessageStore, RetryBand, StoreError};

/// In-memory work record store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    records: RwLock<HashMap<MessageId, WorkRecord>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Every stored record, in no particular order.
    pub fn all(&self) -> Result<Vec<WorkRecord>, StoreError> {
        Ok(self.read()?.values().cloned().collect())
    }

    pub fn len(&self) -> usize {
        self.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<MessageId, WorkRecord>>, StoreError> {
        self.records
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<MessageId, WorkRecord>>, StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))
    }

    fn select(
        &self,
        predicate: impl Fn(&WorkRecord) -> bool,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|r| predicate(r))
            .cloned()
            .collect())
    }
}

impl MessageStore for InMemoryMessageStore {
    fn insert(&self, record: &WorkRecord) -> Result<(), StoreError> {
        let mut records = self.write()?;
        if records.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    fn update(&self, record: &WorkRecord) -> Result<(), StoreError> {
        let mut records = self.write()?;
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id)),
        }
    }

    fn delete(&self, record: &WorkRecord) -> Result<(), StoreError> {
        self.write()?.remove(&record.id);
        Ok(())
    }

    fn get(&self, id: MessageId) -> Result<Option<WorkRecord>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    fn find_unprocessed_by_entity(
        &self,
        entity_id: EntityId,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        self.select(|r| r.entity_id == entity_id && !r.is_processed())
    }

    fn find_by_event_type_and_retry_count(
        &self,
        event_type: &EventType,
        retry_count: u32,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        self.select(|r| &r.event_type == event_type && r.retry_count == retry_count)
    }

    fn find_unprocessed_by_retry_band(
        &self,
        band: RetryBand,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        self.select(|r| band.contains(r.retry_count) && !r.is_processed())
    }

    fn find_unattempted_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        self.select(|r| r.retry_count == 0 && r.created_date < cutoff && !r.is_processed())
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut records = self.write()?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        Ok(before - records.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(entity: i64, event_type: EventType, created: DateTime<Utc>) -> WorkRecord {
        WorkRecord::new(EntityId::new(entity), event_type, "{}", created)
    }

    #[test]
    fn insert_rejects_duplicate_ids() {
        let store = InMemoryMessageStore::new();
        let r = record(1, EventType::SentenceImposed, Utc::now());
        store.insert(&r).unwrap();
        assert!(matches!(store.insert(&r), Err(StoreError::AlreadyExists(id)) if id == r.id));
    }

    #[test]
    fn update_replaces_and_requires_existing_record() {
        let store = InMemoryMessageStore::new();
        let mut r = record(1, EventType::SentenceImposed, Utc::now());
        assert!(matches!(store.update(&r), Err(StoreError::NotFound(_))));

        store.insert(&r).unwrap();
        r.record_failure("RETRY", None, Utc::now());
        store.update(&r).unwrap();
        assert_eq!(store.get(r.id).unwrap().unwrap().retry_count, 1);
    }

    #[test]
    fn delete_is_idempotent() {
        let store = InMemoryMessageStore::new();
        let r = record(1, EventType::SentenceImposed, Utc::now());
        store.insert(&r).unwrap();
        store.delete(&r).unwrap();
        store.delete(&r).unwrap();
        assert!(store.get(r.id).unwrap().is_none());
    }

    #[test]
    fn entity_query_skips_processed_records() {
        let store = InMemoryMessageStore::new();
        let now = Utc::now();
        let pending = record(7, EventType::SentenceImposed, now);
        let mut done = record(7, EventType::BookingNumberChanged, now);
        done.mark_processed("PROCESSED", now).unwrap();
        let other = record(8, EventType::SentenceImposed, now);
        for r in [&pending, &done, &other] {
            store.insert(r).unwrap();
        }

        let found = store.find_unprocessed_by_entity(EntityId::new(7)).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, pending.id);
    }

    #[test]
    fn retry_band_query_is_inclusive_and_skips_processed() {
        let store = InMemoryMessageStore::new();
        let now = Utc::now();
        for count in [0u32, 1, 4, 5, 11] {
            let mut r = record(count as i64, EventType::SentenceImposed, now);
            r.retry_count = count;
            store.insert(&r).unwrap();
        }
        let mut processed = record(99, EventType::SentenceImposed, now);
        processed.retry_count = 2;
        processed.mark_processed("PROCESSED", now).unwrap();
        store.insert(&processed).unwrap();

        let mut counts: Vec<u32> = store
            .find_unprocessed_by_retry_band(RetryBand::new(1, 4))
            .unwrap()
            .iter()
            .map(|r| r.retry_count)
            .collect();
        counts.sort();
        assert_eq!(counts, vec![1, 4]);

        let unbounded = store
            .find_unprocessed_by_retry_band(RetryBand::at_least(11))
            .unwrap();
        assert_eq!(unbounded.len(), 1);
    }

    #[test]
    fn unattempted_query_uses_strict_cutoff() {
        let store = InMemoryMessageStore::new();
        let cutoff = Utc::now();
        let old = record(1, EventType::SentenceImposed, cutoff - Duration::seconds(1));
        let at_cutoff = record(2, EventType::SentenceImposed, cutoff);
        let mut retried = record(3, EventType::SentenceImposed, cutoff - Duration::hours(1));
        retried.retry_count = 1;
        for r in [&old, &at_cutoff, &retried] {
            store.insert(r).unwrap();
        }

        let found = store.find_unattempted_created_before(cutoff).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, old.id);
    }

    #[test]
    fn event_type_query_includes_processed_records() {
        let store = InMemoryMessageStore::new();
        let now = Utc::now();
        let mut done = record(1, EventType::SentenceDatesChanged, now);
        done.mark_processed("PROCESSED", now).unwrap();
        store.insert(&done).unwrap();
        store
            .insert(&record(2, EventType::SentenceImposed, now))
            .unwrap();

        let found = store
            .find_by_event_type_and_retry_count(&EventType::SentenceDatesChanged, 0)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, done.id);
    }

    #[test]
    fn delete_expired_removes_processed_and_unprocessed() {
        let store = InMemoryMessageStore::new();
        let now = Utc::now();
        let stale = record(1, EventType::SentenceImposed, now - Duration::days(8));
        let mut stale_done = record(2, EventType::SentenceImposed, now - Duration::days(8));
        stale_done.mark_processed("PROCESSED", now).unwrap();
        let fresh = record(3, EventType::SentenceImposed, now);
        for r in [&stale, &stale_done, &fresh] {
            store.insert(r).unwrap();
        }

        assert_eq!(store.delete_expired(now).unwrap(), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get(fresh.id).unwrap().is_some());
    }
}
