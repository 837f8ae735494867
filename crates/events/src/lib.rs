//! Inbound events: the envelope consumed from the source-of-record stream.
//!
//! The event type set and its priorities live in `reconciler-core`; this crate
//! turns raw queue messages into never-attempted work records.

pub mod envelope;

pub use envelope::{ENTITY_ID_FIELD, EVENT_TYPE_FIELD, EnvelopeError, InboundEnvelope};
