//! Postgres-backed work record store.
//!
//! Each record is a single row in `messages` (see `schema`). Every mutation
//! touches exactly one row, so there is no cross-record transaction and the
//! store is last-write-wins, as the pipeline expects.
//!
//! ## Sync boundary
//!
//! `MessageStore` is synchronous because scheduled passes run on plain worker
//! threads. The store keeps a `tokio::runtime::Handle` and blocks on it, which
//! is only valid from threads that are **not** driving that runtime. The async
//! inherent methods are available for callers already inside the runtime.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` |
//! | Database (other) | Any other | `Storage` |
//! | PoolClosed / network / other | N/A | `Storage` |
//! | Row decode failure | N/A | `Corrupt` |

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;
use uuid::Uuid;

use reconciler_core::{EntityId, EventType, MessageId, WorkRecord};

use super::r#trait::{MessageStore, RetryBand, StoreError};
use super::schema;

const SELECT_COLUMNS: &str = r#"
    SELECT
        id,
        entity_id,
        event_type,
        payload,
        created_date,
        retry_count,
        expiry,
        processed_date,
        status
    FROM messages
"#;

/// Postgres-backed work record store.
#[derive(Debug, Clone)]
pub struct PostgresMessageStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresMessageStore {
    /// Create a store over `pool`, blocking on `runtime` for the sync API.
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bring the schema up to date.
    pub async fn migrate(&self) -> Result<usize, StoreError> {
        schema::migrate(&self.pool).await
    }

    #[instrument(skip(self, record), fields(id = %record.id, entity_id = %record.entity_id), err)]
    pub async fn insert_record(&self, record: &WorkRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO messages (
                id,
                entity_id,
                event_type,
                payload,
                created_date,
                retry_count,
                expiry,
                processed_date,
                status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.entity_id.value())
        .bind(record.event_type.as_str())
        .bind(&record.payload)
        .bind(record.created_date)
        .bind(retry_count_to_db(record.retry_count))
        .bind(record.expiry.timestamp())
        .bind(record.processed_date)
        .bind(record.status.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(record.id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self, record), fields(id = %record.id, retry_count = record.retry_count), err)]
    pub async fn update_record(&self, record: &WorkRecord) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE messages
            SET
                entity_id = $2,
                event_type = $3,
                payload = $4,
                created_date = $5,
                retry_count = $6,
                expiry = $7,
                processed_date = $8,
                status = $9
            WHERE id = $1
            "#,
        )
        .bind(record.id.as_uuid())
        .bind(record.entity_id.value())
        .bind(record.event_type.as_str())
        .bind(&record.payload)
        .bind(record.created_date)
        .bind(retry_count_to_db(record.retry_count))
        .bind(record.expiry.timestamp())
        .bind(record.processed_date)
        .bind(record.status.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(record.id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn delete_record(&self, id: MessageId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_record(&self, id: MessageId) -> Result<Option<WorkRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_unprocessed_by_entity(
        &self,
        entity_id: EntityId,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE entity_id = $1 AND processed_date IS NULL");
        let rows = sqlx::query(&sql)
            .bind(entity_id.value())
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_unprocessed_by_entity", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), fields(event_type = %event_type), err)]
    pub async fn fetch_by_event_type_and_retry_count(
        &self,
        event_type: &EventType,
        retry_count: u32,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE event_type = $1 AND retry_count = $2");
        let rows = sqlx::query(&sql)
            .bind(event_type.as_str())
            .bind(retry_count_to_db(retry_count))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_by_event_type_and_retry_count", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), fields(band = %band), err)]
    pub async fn fetch_unprocessed_by_retry_band(
        &self,
        band: RetryBand,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE retry_count >= $1 AND ($2::integer IS NULL OR retry_count <= $2) AND processed_date IS NULL"
        );
        let rows = sqlx::query(&sql)
            .bind(retry_count_to_db(band.min))
            .bind(band.max.map(retry_count_to_db))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_unprocessed_by_retry_band", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn fetch_unattempted_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE retry_count = 0 AND created_date < $1 AND processed_date IS NULL"
        );
        let rows = sqlx::query(&sql)
            .bind(cutoff)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_unattempted_created_before", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(skip(self), err)]
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM messages WHERE expiry <= $1")
            .bind(now.timestamp())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_expired", e))?;

        Ok(result.rows_affected() as usize)
    }
}

impl MessageStore for PostgresMessageStore {
    fn insert(&self, record: &WorkRecord) -> Result<(), StoreError> {
        self.runtime.block_on(self.insert_record(record))
    }

    fn update(&self, record: &WorkRecord) -> Result<(), StoreError> {
        self.runtime.block_on(self.update_record(record))
    }

    fn delete(&self, record: &WorkRecord) -> Result<(), StoreError> {
        self.runtime.block_on(self.delete_record(record.id))
    }

    fn get(&self, id: MessageId) -> Result<Option<WorkRecord>, StoreError> {
        self.runtime.block_on(self.fetch_record(id))
    }

    fn find_unprocessed_by_entity(
        &self,
        entity_id: EntityId,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        self.runtime
            .block_on(self.fetch_unprocessed_by_entity(entity_id))
    }

    fn find_by_event_type_and_retry_count(
        &self,
        event_type: &EventType,
        retry_count: u32,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        self.runtime
            .block_on(self.fetch_by_event_type_and_retry_count(event_type, retry_count))
    }

    fn find_unprocessed_by_retry_band(
        &self,
        band: RetryBand,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        self.runtime
            .block_on(self.fetch_unprocessed_by_retry_band(band))
    }

    fn find_unattempted_created_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<WorkRecord>, StoreError> {
        self.runtime
            .block_on(self.fetch_unattempted_created_before(cutoff))
    }

    fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        self.runtime.block_on(self.purge_expired(now))
    }
}

fn retry_count_to_db(retry_count: u32) -> i32 {
    i32::try_from(retry_count).unwrap_or(i32::MAX)
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkRecord, StoreError> {
    let corrupt = |e: sqlx::Error| StoreError::Corrupt(format!("failed to decode message row: {e}"));

    let id: Uuid = row.try_get("id").map_err(corrupt)?;
    let entity_id: i64 = row.try_get("entity_id").map_err(corrupt)?;
    let event_type: String = row.try_get("event_type").map_err(corrupt)?;
    let payload: String = row.try_get("payload").map_err(corrupt)?;
    let created_date: DateTime<Utc> = row.try_get("created_date").map_err(corrupt)?;
    let retry_count: i32 = row.try_get("retry_count").map_err(corrupt)?;
    let expiry: i64 = row.try_get("expiry").map_err(corrupt)?;
    let processed_date: Option<DateTime<Utc>> = row.try_get("processed_date").map_err(corrupt)?;
    let status: Option<String> = row.try_get("status").map_err(corrupt)?;

    let retry_count = u32::try_from(retry_count)
        .map_err(|_| StoreError::Corrupt(format!("negative retry_count on {id}")))?;
    let expiry = DateTime::<Utc>::from_timestamp(expiry, 0)
        .ok_or_else(|| StoreError::Corrupt(format!("expiry out of range on {id}")))?;

    Ok(WorkRecord {
        id: MessageId::from_uuid(id),
        entity_id: EntityId::new(entity_id),
        event_type: EventType::parse(&event_type),
        payload,
        created_date,
        retry_count,
        expiry,
        processed_date,
        status,
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => StoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
