//! Versioned Postgres schema for the work record store and scheduler locks.
//!
//! Migrations are numbered, checked in, and applied in order. Applied
//! versions are tracked in `schema_version`, so `migrate` is idempotent.

use sqlx::{PgPool, Row};
use tracing::info;

use super::r#trait::StoreError;

/// One forward-only schema change.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub version: i32,
    pub name: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_messages",
        sql: include_str!("../../migrations/0001_create_messages.sql"),
    },
    Migration {
        version: 2,
        name: "create_scheduler_locks",
        sql: include_str!("../../migrations/0002_create_scheduler_locks.sql"),
    },
];

/// Highest schema version this build knows about.
pub fn current_version() -> i32 {
    MIGRATIONS.iter().map(|m| m.version).max().unwrap_or(0)
}

/// Apply every migration newer than the recorded schema version.
///
/// Returns the number of migrations applied.
pub async fn migrate(pool: &PgPool) -> Result<usize, StoreError> {
    sqlx::raw_sql(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER     PRIMARY KEY,
            name        TEXT        NOT NULL,
            applied_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| StoreError::Storage(format!("create schema_version: {e}")))?;

    let row = sqlx::query("SELECT COALESCE(MAX(version), 0) AS version FROM schema_version")
        .fetch_one(pool)
        .await
        .map_err(|e| StoreError::Storage(format!("read schema_version: {e}")))?;
    let applied: i32 = row
        .try_get("version")
        .map_err(|e| StoreError::Storage(format!("read schema_version: {e}")))?;

    let mut count = 0;
    for migration in MIGRATIONS.iter().filter(|m| m.version > applied) {
        let mut tx = pool
            .begin()
            .await
            .map_err(|e| StoreError::Storage(format!("begin migration: {e}")))?;

        sqlx::raw_sql(migration.sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                StoreError::Storage(format!(
                    "migration {} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;

        sqlx::query("INSERT INTO schema_version (version, name) VALUES ($1, $2)")
            .bind(migration.version)
            .bind(migration.name)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Storage(format!("record migration: {e}")))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::Storage(format!("commit migration: {e}")))?;

        info!(
            version = migration.version,
            name = migration.name,
            "applied schema migration"
        );
        count += 1;
    }

    Ok(count)
}
