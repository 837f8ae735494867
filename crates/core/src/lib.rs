//! `reconciler-core`: reconciliation domain building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! the work record that tracks one unit of pending synchronization work, the
//! outcome of dispatching it, and the identifiers that key both.

pub mod error;
pub mod event_type;
pub mod id;
pub mod outcome;
pub mod record;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use event_type::{EventType, UNKNOWN_PRIORITY};
pub use id::{EntityId, MessageId};
pub use outcome::DispatchOutcome;
pub use record::{DEFAULT_EXPIRY_DAYS, WorkRecord, whole_seconds};
