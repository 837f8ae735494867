//! Inbound message intake: raw queue message to a stored work record.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, instrument};

use reconciler_core::{DEFAULT_EXPIRY_DAYS, WorkRecord};
use reconciler_events::{EnvelopeError, InboundEnvelope};

use crate::config::ReconcilerConfig;
use crate::store::{MessageStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Turns inbound messages into never-attempted work records.
///
/// Replayed dead-letter messages go through the same path.
#[derive(Debug)]
pub struct MessageIntake<S> {
    store: S,
    expiry_after: Duration,
}

impl<S> MessageIntake<S>
where
    S: MessageStore,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            expiry_after: Duration::days(DEFAULT_EXPIRY_DAYS),
        }
    }

    /// An intake using the configured default expiry.
    pub fn from_config(config: &ReconcilerConfig, store: S) -> Self {
        Self::new(store).with_expiry_after(config.default_expiry)
    }

    pub fn with_expiry_after(mut self, expiry_after: Duration) -> Self {
        self.expiry_after = expiry_after;
        self
    }

    pub fn receive(&self, raw: &str) -> Result<WorkRecord, IntakeError> {
        self.receive_at(raw, Utc::now())
    }

    /// Parse `raw` and insert it as a new record received at `now`.
    #[instrument(skip(self, raw), err)]
    pub fn receive_at(&self, raw: &str, now: DateTime<Utc>) -> Result<WorkRecord, IntakeError> {
        let envelope = InboundEnvelope::parse(raw)?;
        let record = envelope.into_record(now, self.expiry_after);
        self.store.insert(&record)?;

        debug!(
            id = %record.id,
            entity_id = %record.entity_id,
            event_type = %record.event_type,
            "stored inbound message"
        );
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMessageStore;
    use reconciler_core::{EntityId, EventType};
    use serde_json::json;

    #[test]
    fn receive_stores_never_attempted_record() {
        let store = InMemoryMessageStore::arc();
        let intake = MessageIntake::new(store.clone());
        let now = Utc::now();
        let raw = json!({ "eventType": "SENTENCE_IMPOSED", "bookingId": 42 }).to_string();

        let record = intake.receive_at(&raw, now).unwrap();

        assert_eq!(record.entity_id, EntityId::new(42));
        assert_eq!(record.event_type, EventType::SentenceImposed);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.created_date, now);
        assert_eq!(record.expiry.timestamp(), (now + Duration::days(7)).timestamp());
        assert!(!record.is_processed());
        assert_eq!(store.get(record.id).unwrap(), Some(record));
    }

    #[test]
    fn unknown_event_types_are_accepted() {
        let store = InMemoryMessageStore::arc();
        let intake = MessageIntake::new(store.clone()).with_expiry_after(Duration::days(1));
        let raw = json!({ "eventType": "ALERT-UPDATED", "bookingId": "7" }).to_string();

        let record = intake.receive(&raw).unwrap();
        assert_eq!(record.event_type, EventType::parse("ALERT-UPDATED"));
        assert_eq!(
            record.expiry.timestamp(),
            (record.created_date + Duration::days(1)).timestamp()
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn from_config_applies_default_expiry() {
        let config = ReconcilerConfig {
            default_expiry: Duration::days(30),
            ..ReconcilerConfig::default()
        };
        let store = InMemoryMessageStore::arc();
        let intake = MessageIntake::from_config(&config, store.clone());
        let now = Utc::now();
        let raw = json!({ "eventType": "SENTENCE_IMPOSED", "bookingId": 3 }).to_string();

        let record = intake.receive_at(&raw, now).unwrap();
        assert_eq!(record.expiry.timestamp(), (now + Duration::days(30)).timestamp());
        assert!(!record.is_expired(now + Duration::days(29)));
        assert_eq!(store.get(record.id).unwrap(), Some(record));
    }

    #[test]
    fn messages_without_entity_are_rejected() {
        let store = InMemoryMessageStore::arc();
        let intake = MessageIntake::new(store.clone());
        let raw = json!({ "eventType": "SENTENCE_IMPOSED" }).to_string();

        let err = intake.receive(&raw).unwrap_err();
        assert!(matches!(
            err,
            IntakeError::Envelope(EnvelopeError::MissingEntityId)
        ));
        assert!(store.is_empty());
    }
}
