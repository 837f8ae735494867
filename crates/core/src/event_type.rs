//! The enumerated set of inbound event types and their processing priority.

use core::str::FromStr;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Discriminator selecting which domain handler applies to a record.
///
/// Unknown wire values are preserved verbatim so they can be stored, reported
/// and dispatched to the no-op outcome instead of being rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    ImprisonmentStatusChanged,
    ExternalMovementInserted,
    SentenceDatesChanged,
    ConfirmedReleaseDateChanged,
    SentenceImposed,
    BookingNumberChanged,
    Unknown(String),
}

/// Rank given to event types without a known priority.
pub const UNKNOWN_PRIORITY: u8 = 99;

impl EventType {
    /// Every known event type, in declaration order.
    pub const KNOWN: [EventType; 6] = [
        EventType::ImprisonmentStatusChanged,
        EventType::ExternalMovementInserted,
        EventType::SentenceDatesChanged,
        EventType::ConfirmedReleaseDateChanged,
        EventType::SentenceImposed,
        EventType::BookingNumberChanged,
    ];

    /// Wire name used in inbound envelopes and in the store.
    pub fn as_str(&self) -> &str {
        match self {
            EventType::ImprisonmentStatusChanged => "IMPRISONMENT_STATUS-CHANGED",
            EventType::ExternalMovementInserted => "EXTERNAL_MOVEMENT_RECORD-INSERTED",
            EventType::SentenceDatesChanged => "SENTENCE_DATES-CHANGED",
            EventType::ConfirmedReleaseDateChanged => "CONFIRMED_RELEASE_DATE-CHANGED",
            EventType::SentenceImposed => "SENTENCE_IMPOSED",
            EventType::BookingNumberChanged => "BOOKING_NUMBER-CHANGED",
            EventType::Unknown(name) => name,
        }
    }

    /// Fixed priority rank; lower is more urgent.
    ///
    /// Status changes rank first, structural identity changes last.
    pub fn priority(&self) -> u8 {
        match self {
            EventType::ImprisonmentStatusChanged => 1,
            EventType::ExternalMovementInserted => 2,
            EventType::SentenceDatesChanged
            | EventType::ConfirmedReleaseDateChanged
            | EventType::SentenceImposed => 3,
            EventType::BookingNumberChanged => 4,
            EventType::Unknown(_) => UNKNOWN_PRIORITY,
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, EventType::Unknown(_))
    }

    /// Parse a wire name; never fails.
    pub fn parse(name: &str) -> Self {
        Self::KNOWN
            .iter()
            .find(|known| known.as_str() == name)
            .cloned()
            .unwrap_or_else(|| EventType::Unknown(name.to_string()))
    }
}

impl core::fmt::Display for EventType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::parse(&name))
    }
}
