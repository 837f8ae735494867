use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{LockError, LockLease, LockProvider, check_duration};

#[derive(Debug)]
struct Held {
    token: String,
    until: Instant,
}

/// Process-local lock provider.
///
/// Only excludes passes within one process. Intended for tests/dev and
/// single-instance deployments.
#[derive(Debug, Default)]
pub struct InMemoryLockProvider {
    held: Mutex<HashMap<String, Held>>,
}

impl InMemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Whether `name` is currently held by anyone.
    pub fn is_held(&self, name: &str) -> bool {
        self.held
            .lock()
            .map(|held| held.get(name).is_some_and(|h| h.until > Instant::now()))
            .unwrap_or(false)
    }
}

impl LockProvider for InMemoryLockProvider {
    fn try_acquire(
        &self,
        name: &str,
        max_duration: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        check_duration(name, max_duration)?;

        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))?;

        let now = Instant::now();
        if held.get(name).is_some_and(|h| h.until > now) {
            return Ok(None);
        }

        let lease = LockLease::new(name, max_duration);
        held.insert(
            name.to_string(),
            Held {
                token: lease.token.clone(),
                until: now + max_duration,
            },
        );
        Ok(Some(lease))
    }

    fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| LockError::Backend("lock table poisoned".to_string()))?;

        if held.get(&lease.name).is_some_and(|h| h.token == lease.token) {
            held.remove(&lease.name);
        }
        Ok(())
    }
}
