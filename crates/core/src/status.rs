//! Well-known status labels written to `WorkRecord::status`.
//!
//! Status is a reporting label only; control flow never branches on it.
//! Handlers are free to use their own labels for ignore reasons.

/// Downstream update applied.
pub const PROCESSED: &str = "PROCESSED";

/// No handler is registered for the record's event type.
pub const NO_HANDLER: &str = "NO_HANDLER";

/// The handler asked for the record to be retried.
pub const RETRY: &str = "RETRY";

/// The handler raised an error; the record is retried.
pub const ERROR: &str = "ERROR";
