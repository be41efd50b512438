//! Postgres-backed event store implementation.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | EventStoreError | Scenario |
//! |------------|----------------------|-----------------|----------|
//! | Database (unique violation) | `23505` | `Concurrency` | Concurrent append won the same `(aggregate_id, version)` |
//! | Database (check violation) | `23514` | `InvalidAppend` | Invalid data (e.g. version <= 0) |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed / Io / other | N/A | `Storage` | Network errors, connection failures, etc. |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use chronicle_core::AggregateId;

use super::r#trait::{EventStore, EventStoreError, NewEvent, StoredEvent};

/// Postgres-backed append-only event store.
///
/// `append()` runs one transaction that:
/// 1. Reads the current stream version (`MAX(version)`)
/// 2. Compares it with `expected_version`
/// 3. Inserts the batch with consecutive versions
///
/// No lock is taken between the read and the insert. If another transaction
/// commits the same version first, the primary key on `(aggregate_id, version)`
/// rejects the insert and the whole transaction rolls back as a concurrency error.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: Arc<PgPool>,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    #[instrument(skip(self), fields(aggregate_id = %aggregate_id, event_count), err)]
    pub async fn load_stream(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT aggregate_id, version, event_type, payload, occurred_at
            FROM events
            WHERE aggregate_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(aggregate_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_stream", e))?;

        let mut stored_events = Vec::with_capacity(rows.len());
        for row in rows {
            let stored = StoredEventRow::from_row(&row)
                .map_err(|e| EventStoreError::Storage(format!("failed to deserialize event row: {e}")))?;
            stored_events.push(stored.try_into()?);
        }

        Span::current().record("event_count", stored_events.len());
        Ok(stored_events)
    }

    #[instrument(
        skip(self, events),
        fields(aggregate_id = %aggregate_id, event_count = events.len()),
        err
    )]
    pub async fn append_events(
        &self,
        aggregate_id: &AggregateId,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let current_version = check_stream_version(&mut tx, aggregate_id).await?;
        if current_version != expected_version {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(EventStoreError::Concurrency(format!(
                "aggregate {aggregate_id}: expected version {expected_version}, found {current_version}"
            )));
        }
        if events.is_empty() {
            // Dropping the transaction rolls it back.
            return Ok(vec![]);
        }

        let mut stored_events = Vec::with_capacity(events.len());
        let mut next_version = current_version + 1;

        for event in events {
            sqlx::query(
                r#"
                INSERT INTO events (aggregate_id, version, event_type, payload, occurred_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(aggregate_id.as_str())
            .bind(to_db_version(next_version)?)
            .bind(&event.event_type)
            .bind(&event.payload)
            .bind(event.occurred_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    EventStoreError::Concurrency(format!(
                        "aggregate {aggregate_id}: version {next_version} was appended concurrently"
                    ))
                } else {
                    map_sqlx_error("insert_event", e)
                }
            })?;

            stored_events.push(StoredEvent {
                aggregate_id: aggregate_id.clone(),
                version: next_version,
                event_type: event.event_type,
                payload: event.payload,
                occurred_at: event.occurred_at,
            });
            next_version += 1;
        }

        tx.commit().await.map_err(|e| {
            if is_unique_violation(&e) {
                EventStoreError::Concurrency(format!("aggregate {aggregate_id}: concurrent append at commit"))
            } else {
                map_sqlx_error("commit_transaction", e)
            }
        })?;

        Ok(stored_events)
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.append_events(aggregate_id, expected_version, events).await
    }

    async fn load(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        self.load_stream(aggregate_id).await
    }
}

/// Current version of a stream (0 if it doesn't exist).
async fn check_stream_version(
    tx: &mut Transaction<'_, Postgres>,
    aggregate_id: &AggregateId,
) -> Result<u64, EventStoreError> {
    let row = sqlx::query(
        r#"
        SELECT COALESCE(MAX(version), 0) AS current_version
        FROM events
        WHERE aggregate_id = $1
        "#,
    )
    .bind(aggregate_id.as_str())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("check_stream_version", e))?;

    let current_version: i64 = row
        .try_get("current_version")
        .map_err(|e| EventStoreError::Storage(format!("failed to read current_version: {e}")))?;

    u64::try_from(current_version)
        .map_err(|_| EventStoreError::Storage(format!("negative stream version {current_version}")))
}

fn to_db_version(version: u64) -> Result<i64, EventStoreError> {
    i64::try_from(version).map_err(|_| EventStoreError::InvalidAppend(format!("version {version} out of range")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> EventStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {operation}: {}", db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => EventStoreError::Concurrency(msg),
                Some("23514") => EventStoreError::InvalidAppend(msg),
                _ => EventStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => EventStoreError::Storage(format!("connection pool closed in {operation}")),
        other => EventStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

#[derive(Debug)]
struct StoredEventRow {
    aggregate_id: String,
    version: i64,
    event_type: String,
    payload: Vec<u8>,
    occurred_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEventRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEventRow {
            aggregate_id: row.try_get("aggregate_id")?,
            version: row.try_get("version")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            occurred_at: row.try_get("occurred_at")?,
        })
    }
}

impl TryFrom<StoredEventRow> for StoredEvent {
    type Error = EventStoreError;

    fn try_from(row: StoredEventRow) -> Result<Self, Self::Error> {
        let aggregate_id = AggregateId::new(row.aggregate_id)
            .map_err(|e| EventStoreError::Storage(format!("stored aggregate_id invalid: {e}")))?;
        let version = u64::try_from(row.version)
            .map_err(|_| EventStoreError::Storage(format!("stored version {} invalid", row.version)))?;

        Ok(StoredEvent {
            aggregate_id,
            version,
            event_type: row.event_type,
            payload: row.payload,
            occurred_at: row.occurred_at,
        })
    }
}
