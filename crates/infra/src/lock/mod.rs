//! Single-execution guard for scheduled passes.
//!
//! A named lock runs its body at most once concurrently across every
//! instance sharing the backing store. A lock that can't be acquired skips
//! the body; nothing is queued. Every lease carries a `max_duration` after
//! which another instance may take the lock over.

pub mod in_memory;
pub mod postgres;
#[cfg(feature = "redis")]
pub mod redis;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};
use uuid::Uuid;

pub use in_memory::InMemoryLockProvider;
pub use postgres::PostgresLockProvider;
#[cfg(feature = "redis")]
pub use self::redis::RedisLockProvider;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),

    #[error("invalid lock duration for {name}: {reason}")]
    InvalidDuration { name: String, reason: String },
}

/// Proof of holding a named lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    /// Unique per acquisition; release only succeeds for the same token.
    pub token: String,
    pub max_duration: Duration,
}

impl LockLease {
    pub fn new(name: impl Into<String>, max_duration: Duration) -> Self {
        Self {
            name: name.into(),
            token: format!("{}:{}", std::process::id(), Uuid::now_v7()),
            max_duration,
        }
    }
}

/// Mutual-exclusion store behind the guard.
pub trait LockProvider: Send + Sync {
    /// Take `name` for at most `max_duration`, or `None` if someone else holds it.
    fn try_acquire(&self, name: &str, max_duration: Duration)
    -> Result<Option<LockLease>, LockError>;

    /// Give the lock back early. Releasing a lease that has already been
    /// taken over is a no-op.
    fn release(&self, lease: &LockLease) -> Result<(), LockError>;
}

impl<L> LockProvider for Arc<L>
where
    L: LockProvider + ?Sized,
{
    fn try_acquire(
        &self,
        name: &str,
        max_duration: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        (**self).try_acquire(name, max_duration)
    }

    fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        (**self).release(lease)
    }
}

/// Run `body` under the named lock.
///
/// Returns `Ok(None)` when the lock is held elsewhere and `body` was skipped.
/// A failed release is logged; the lease still expires after `max_duration`.
pub fn with_lock<L, T, F>(
    provider: &L,
    name: &str,
    max_duration: Duration,
    body: F,
) -> Result<Option<T>, LockError>
where
    L: LockProvider + ?Sized,
    F: FnOnce() -> T,
{
    let Some(lease) = provider.try_acquire(name, max_duration)? else {
        debug!(lock = name, "lock held elsewhere; skipping");
        return Ok(None);
    };

    let result = body();

    if let Err(e) = provider.release(&lease) {
        warn!(lock = name, error = %e, "failed to release lock");
    }
    Ok(Some(result))
}

/// Rejects durations the backends can't represent.
pub(crate) fn check_duration(name: &str, max_duration: Duration) -> Result<(), LockError> {
    if max_duration.is_zero() {
        return Err(LockError::InvalidDuration {
            name: name.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    if chrono::Duration::from_std(max_duration).is_err() {
        return Err(LockError::InvalidDuration {
            name: name.to_string(),
            reason: "out of range".to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_lock_runs_body_and_releases() {
        let locks = InMemoryLockProvider::new();
        let ran = with_lock(&locks, "pass", Duration::from_secs(60), || 7).unwrap();
        assert_eq!(ran, Some(7));

        // Released, so a second run proceeds.
        let again = with_lock(&locks, "pass", Duration::from_secs(60), || 8).unwrap();
        assert_eq!(again, Some(8));
    }

    #[test]
    fn with_lock_skips_when_held() {
        let locks = InMemoryLockProvider::new();
        let held = locks
            .try_acquire("pass", Duration::from_secs(60))
            .unwrap()
            .unwrap();

        let mut ran = false;
        let result = with_lock(&locks, "pass", Duration::from_secs(60), || ran = true).unwrap();
        assert!(result.is_none());
        assert!(!ran);

        // Other names are independent.
        assert!(
            with_lock(&locks, "other", Duration::from_secs(60), || ())
                .unwrap()
                .is_some()
        );

        locks.release(&held).unwrap();
    }

    #[test]
    fn zero_duration_is_rejected() {
        let locks = InMemoryLockProvider::new();
        let err = locks.try_acquire("pass", Duration::ZERO).unwrap_err();
        assert!(matches!(err, LockError::InvalidDuration { .. }));
    }

    #[test]
    fn lease_tokens_are_unique() {
        let a = LockLease::new("pass", Duration::from_secs(1));
        let b = LockLease::new("pass", Duration::from_secs(1));
        assert_ne!(a.token, b.token);
    }
}
