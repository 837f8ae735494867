//! Background workers driving the scheduled passes.

pub mod pass_scheduler;

pub use pass_scheduler::{PassScheduler, SchedulerHandle, TickOutcome, run_guarded};
