use chrono::{DateTime, Duration, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use reconciler_core::{EntityId, EventType, WorkRecord};

/// Field carrying the logical entity of an inbound event.
pub const ENTITY_ID_FIELD: &str = "bookingId";

/// Field carrying the event discriminator.
pub const EVENT_TYPE_FIELD: &str = "eventType";

/// Inbound message that could not be turned into a work record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message has no eventType")]
    MissingEventType,

    #[error("message has no usable bookingId")]
    MissingEntityId,
}

/// Parsed inbound event: `{ eventType: string, ...domain fields }`.
///
/// Two shapes are accepted:
/// - the bare event body
/// - a topic notification wrapping the body as a JSON string in `Message`,
///   with the discriminator optionally carried in
///   `MessageAttributes.eventType.Value`
///
/// Unknown event types are accepted; they are routed to a no-op outcome at
/// dispatch time rather than rejected here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    event_type: EventType,
    entity_id: EntityId,
    body: String,
}

impl InboundEnvelope {
    pub fn parse(raw: &str) -> Result<Self, EnvelopeError> {
        let outer: JsonValue =
            serde_json::from_str(raw).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;

        let notification = outer.get("Message").and_then(JsonValue::as_str);
        let (body_value, body, attribute_type) = match notification {
            Some(inner) => {
                let value: JsonValue = serde_json::from_str(inner)
                    .map_err(|e| EnvelopeError::Malformed(format!("notification body: {e}")))?;
                let attribute_type = outer
                    .pointer("/MessageAttributes/eventType/Value")
                    .and_then(JsonValue::as_str)
                    .map(str::to_string);
                (value, inner.to_string(), attribute_type)
            }
            None => (outer, raw.to_string(), None),
        };

        if !body_value.is_object() {
            return Err(EnvelopeError::Malformed("event body is not an object".to_string()));
        }

        let event_type = body_value
            .get(EVENT_TYPE_FIELD)
            .and_then(JsonValue::as_str)
            .map(str::to_string)
            .or(attribute_type)
            .filter(|name| !name.trim().is_empty())
            .map(|name| EventType::parse(&name))
            .ok_or(EnvelopeError::MissingEventType)?;

        let entity_id = body_value
            .get(ENTITY_ID_FIELD)
            .and_then(entity_id_from_json)
            .ok_or(EnvelopeError::MissingEntityId)?;

        Ok(Self {
            event_type,
            entity_id,
            body,
        })
    }

    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    pub fn entity_id(&self) -> EntityId {
        self.entity_id
    }

    /// Serialized event body, stored verbatim as the record payload.
    pub fn body(&self) -> &str {
        &self.body
    }

    /// Build a never-attempted work record received at `received_at`.
    ///
    /// An expiry past the representable range saturates.
    pub fn into_record(self, received_at: DateTime<Utc>, expiry_after: Duration) -> WorkRecord {
        let expiry = received_at
            .checked_add_signed(expiry_after)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        WorkRecord::new(self.entity_id, self.event_type, self.body, received_at).with_expiry(expiry)
    }
}

fn entity_id_from_json(value: &JsonValue) -> Option<EntityId> {
    match value {
        JsonValue::Number(n) => n.as_i64().map(EntityId::new),
        JsonValue::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_bare_event_body() {
        let raw = json!({
            "eventType": "IMPRISONMENT_STATUS-CHANGED",
            "bookingId": 1200835,
            "imprisonmentStatusSeq": 0
        })
        .to_string();

        let envelope = InboundEnvelope::parse(&raw).unwrap();
        assert_eq!(envelope.event_type(), &EventType::ImprisonmentStatusChanged);
        assert_eq!(envelope.entity_id(), EntityId::new(1200835));
        assert_eq!(envelope.body(), raw);
    }

    #[test]
    fn unwraps_topic_notification() {
        let inner = json!({ "bookingId": "1200835", "movementSeq": 3 }).to_string();
        let raw = json!({
            "Type": "Notification",
            "Message": inner,
            "MessageAttributes": {
                "eventType": { "Type": "String", "Value": "EXTERNAL_MOVEMENT_RECORD-INSERTED" }
            }
        })
        .to_string();

        let envelope = InboundEnvelope::parse(&raw).unwrap();
        assert_eq!(envelope.event_type(), &EventType::ExternalMovementInserted);
        assert_eq!(envelope.entity_id(), EntityId::new(1200835));
        assert_eq!(envelope.body(), inner);
    }

    #[test]
    fn unknown_event_types_are_accepted() {
        let raw = json!({ "eventType": "OFFENDER_ALIAS-CHANGED", "bookingId": 7 }).to_string();
        let envelope = InboundEnvelope::parse(&raw).unwrap();
        assert_eq!(
            envelope.event_type(),
            &EventType::Unknown("OFFENDER_ALIAS-CHANGED".to_string())
        );
    }

    #[test]
    fn rejects_messages_without_entity_or_type() {
        let no_entity = json!({ "eventType": "SENTENCE_DATES-CHANGED" }).to_string();
        assert_eq!(
            InboundEnvelope::parse(&no_entity),
            Err(EnvelopeError::MissingEntityId)
        );

        let no_type = json!({ "bookingId": 7 }).to_string();
        assert_eq!(
            InboundEnvelope::parse(&no_type),
            Err(EnvelopeError::MissingEventType)
        );

        assert!(matches!(
            InboundEnvelope::parse("not json"),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn record_starts_unattempted_with_expiry() {
        let raw = json!({ "eventType": "SENTENCE_IMPOSED", "bookingId": 9 }).to_string();
        let received = Utc::now();
        let record = InboundEnvelope::parse(&raw)
            .unwrap()
            .into_record(received, Duration::days(7));

        assert_eq!(record.retry_count, 0);
        assert_eq!(record.created_date, received);
        assert_eq!(record.expiry.timestamp(), (received + Duration::days(7)).timestamp());
        assert!(record.processed_date.is_none());
    }

    #[test]
    fn oversized_expiry_saturates() {
        let raw = json!({ "eventType": "SENTENCE_IMPOSED", "bookingId": 9 }).to_string();
        let record = InboundEnvelope::parse(&raw)
            .unwrap()
            .into_record(Utc::now(), Duration::MAX);

        assert_eq!(record.expiry.timestamp(), DateTime::<Utc>::MAX_UTC.timestamp());
    }
}
