//! Work record store boundary.
//!
//! This module defines the durable record of pending reconciliation work and
//! its in-memory (tests/dev) and Postgres implementations.

pub mod in_memory;
pub mod postgres;
pub mod schema;
pub mod r#trait;

pub use in_memory::InMemoryMessageStore;
pub use postgres::PostgresMessageStore;
pub use r#trait::{MessageStore, RetryBand, StoreError};
