//! Infrastructure layer: work record store, dispatch, scheduled passes,
//! locks, config.

pub mod aggregator;
pub mod config;
pub mod dispatcher;
pub mod intake;
pub mod lock;
pub mod pass;
pub mod reporting;
pub mod retry;
pub mod store;
pub mod workers;

pub use aggregator::{AGGREGATE_LOCK, AggregationPlan, Aggregator, plan_batch};
pub use config::{ConfigError, ReconcilerConfig};
pub use dispatcher::{Dispatcher, MessageHandler};
pub use intake::{IntakeError, MessageIntake};
pub use lock::{InMemoryLockProvider, LockError, LockLease, LockProvider, with_lock};
pub use pass::{ExpiryPurge, PassReport, ScheduledPass};
pub use reporting::{BacklogEntry, BacklogReport, backlog_report};
pub use retry::{RetryScheduler, RetryTier};
pub use store::{InMemoryMessageStore, MessageStore, RetryBand, StoreError};
pub use workers::{PassScheduler, SchedulerHandle, TickOutcome};
