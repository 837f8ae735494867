//! Redis-backed lock: `SET NX PX` to acquire, compare-and-delete to release.

use std::sync::Arc;
use std::time::Duration;

use tracing::instrument;

use super::{LockError, LockLease, LockProvider, check_duration};

/// Default key prefix for lock entries.
const DEFAULT_KEY_PREFIX: &str = "reconciler:lock:";

/// Deletes the key only while it still holds our token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLockProvider {
    client: Arc<redis::Client>,
    key_prefix: String,
}

impl RedisLockProvider {
    /// Create a provider for `redis_url` (e.g. "redis://localhost:6379").
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, name: &str) -> String {
        format!("{}{}", self.key_prefix, name)
    }

    fn connection(&self) -> Result<redis::Connection, LockError> {
        self.client
            .get_connection()
            .map_err(|e| LockError::Backend(e.to_string()))
    }
}

impl LockProvider for RedisLockProvider {
    #[instrument(skip(self), err)]
    fn try_acquire(
        &self,
        name: &str,
        max_duration: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        check_duration(name, max_duration)?;
        let millis = u64::try_from(max_duration.as_millis()).map_err(|_| {
            LockError::InvalidDuration {
                name: name.to_string(),
                reason: "out of range".to_string(),
            }
        })?;

        let lease = LockLease::new(name, max_duration);
        let mut conn = self.connection()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(name))
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(millis.max(1))
            .query(&mut conn)
            .map_err(|e| LockError::Backend(format!("acquire {name}: {e}")))?;

        Ok(reply.map(|_| lease))
    }

    #[instrument(skip(self, lease), fields(lock = %lease.name), err)]
    fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        let mut conn = self.connection()?;
        let _: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(self.key(&lease.name))
            .arg(&lease.token)
            .invoke(&mut conn)
            .map_err(|e| LockError::Backend(format!("release {}: {e}", lease.name)))?;
        Ok(())
    }
}
