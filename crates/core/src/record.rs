//! The unit of reconciliation work.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::event_type::EventType;
use crate::id::{EntityId, MessageId};

/// Default lifetime of a record before it may be abandoned.
pub const DEFAULT_EXPIRY_DAYS: i64 = 7;

/// Drop sub-second precision. Expiry is kept at whole seconds so every store
/// holds the same value.
pub fn whole_seconds(at: DateTime<Utc>) -> DateTime<Utc> {
    at.with_nanosecond(0).unwrap_or(at)
}

/// A persisted unit of pending or completed reconciliation work.
///
/// ## Lifecycle
///
/// 1. **Created** on inbound event receipt with `retry_count = 0`
/// 2. **Attempted** by the aggregator or a retry tier; each failed attempt
///    bumps `retry_count` exactly once and may extend `expiry`
/// 3. **Terminated** either by `mark_processed` (success) or by physical
///    deletion (duplicate discard, expiry abandonment)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRecord {
    pub id: MessageId,
    pub entity_id: EntityId,
    pub event_type: EventType,
    /// Serialized event body, interpreted only by the selected handler.
    pub payload: String,
    /// First receipt; never mutated.
    pub created_date: DateTime<Utc>,
    pub retry_count: u32,
    pub expiry: DateTime<Utc>,
    pub processed_date: Option<DateTime<Utc>>,
    /// Last outcome label, for reporting only.
    pub status: Option<String>,
}

impl WorkRecord {
    /// Create a never-attempted record expiring `DEFAULT_EXPIRY_DAYS` after creation.
    pub fn new(
        entity_id: EntityId,
        event_type: EventType,
        payload: impl Into<String>,
        created_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            entity_id,
            event_type,
            payload: payload.into(),
            created_date,
            retry_count: 0,
            expiry: whole_seconds(
                created_date
                    .checked_add_signed(Duration::days(DEFAULT_EXPIRY_DAYS))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC),
            ),
            processed_date: None,
            status: None,
        }
    }

    /// Override the creation-time expiry, truncated to whole seconds.
    pub fn with_expiry(mut self, expiry: DateTime<Utc>) -> Self {
        self.expiry = whole_seconds(expiry);
        self
    }

    pub fn with_id(mut self, id: MessageId) -> Self {
        self.id = id;
        self
    }

    pub fn is_processed(&self) -> bool {
        self.processed_date.is_some()
    }

    /// Never yet attempted.
    pub fn is_first_attempt(&self) -> bool {
        self.retry_count == 0
    }

    /// Past its expiry and eligible for silent abandonment.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_date
    }

    /// Record terminal success. `processed_date` is set exactly once.
    pub fn mark_processed(
        &mut self,
        status: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if let Some(processed) = self.processed_date {
            return Err(DomainError::invariant(format!(
                "record {} already processed at {processed}",
                self.id
            )));
        }
        self.processed_date = Some(now);
        self.status = Some(status.into());
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// `retry_count` increases by exactly one. When `until` is given the
    /// expiry moves to it, but never below the current second; otherwise the
    /// existing expiry stays as the backstop.
    pub fn record_failure(
        &mut self,
        status: impl Into<String>,
        until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) {
        self.retry_count = self.retry_count.saturating_add(1);
        if let Some(until) = until {
            self.expiry = whole_seconds(until.max(now));
        }
        self.status = Some(status.into());
    }
}
