//! Postgres conditional-write lock over the `scheduler_locks` table.
//!
//! Acquire is a single upsert that only overwrites a row whose `lock_until`
//! has passed; the lock is ours iff a row was written. Release shortens
//! `lock_until` to now for our own token only.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tokio::runtime::Handle;
use tracing::instrument;

use super::{LockError, LockLease, LockProvider, check_duration};

#[derive(Debug, Clone)]
pub struct PostgresLockProvider {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresLockProvider {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    #[instrument(skip(self), err)]
    pub async fn acquire(
        &self,
        name: &str,
        max_duration: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        check_duration(name, max_duration)?;
        let max = chrono::Duration::from_std(max_duration)
            .map_err(|e| LockError::Backend(e.to_string()))?;

        let lease = LockLease::new(name, max_duration);
        let now = Utc::now();

        let result = sqlx::query(
            r#"
            INSERT INTO scheduler_locks (name, lock_until, locked_at, locked_by)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO UPDATE
            SET lock_until = EXCLUDED.lock_until,
                locked_at = EXCLUDED.locked_at,
                locked_by = EXCLUDED.locked_by
            WHERE scheduler_locks.lock_until <= EXCLUDED.locked_at
            "#,
        )
        .bind(name)
        .bind(now + max)
        .bind(now)
        .bind(&lease.token)
        .execute(&*self.pool)
        .await
        .map_err(|e| LockError::Backend(format!("acquire {name}: {e}")))?;

        Ok((result.rows_affected() == 1).then_some(lease))
    }

    #[instrument(skip(self, lease), fields(lock = %lease.name), err)]
    pub async fn release_lease(&self, lease: &LockLease) -> Result<(), LockError> {
        sqlx::query(
            r#"
            UPDATE scheduler_locks
            SET lock_until = $3
            WHERE name = $1 AND locked_by = $2
            "#,
        )
        .bind(&lease.name)
        .bind(&lease.token)
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| LockError::Backend(format!("release {}: {e}", lease.name)))?;
        Ok(())
    }
}

impl LockProvider for PostgresLockProvider {
    fn try_acquire(
        &self,
        name: &str,
        max_duration: Duration,
    ) -> Result<Option<LockLease>, LockError> {
        self.runtime.block_on(self.acquire(name, max_duration))
    }

    fn release(&self, lease: &LockLease) -> Result<(), LockError> {
        self.runtime.block_on(self.release_lease(lease))
    }
}
