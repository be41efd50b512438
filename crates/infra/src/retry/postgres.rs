//! Postgres-backed retry ledger (`projection_retries`).
//!
//! Claims use `FOR UPDATE SKIP LOCKED`, so concurrent sweepers never claim the
//! same row in one pass. Every owner-fenced write checks `claimed_by` in its
//! `WHERE` clause and reports whether a row was touched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use chronicle_core::AggregateId;
use chronicle_events::EventEnvelope;

use super::store::{RetryStore, RetryStoreError, lease_expiry};
use super::types::{BackoffPolicy, RetryId, RetryRecord, RetryStats, RetryStatus};

const COLUMNS: &str = "id, aggregate_id, version, event_type, event_payload, attempts, max_attempts, \
     last_error, next_retry_at, status, claimed_by, claim_expires_at, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct PostgresRetryStore {
    pool: Arc<PgPool>,
}

impl PostgresRetryStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_by_event(&self, aggregate_id: &AggregateId, version: u64) -> Result<Option<RetryRecord>, RetryStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM projection_retries WHERE aggregate_id = $1 AND version = $2"
        ))
        .bind(aggregate_id.as_str())
        .bind(to_db_u64(version)?)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage("fetch_by_event", e))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    async fn fetch_list(&self, status: RetryStatus, order_by: &str, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM projection_retries WHERE status = $1 ORDER BY {order_by} LIMIT $2"
        ))
        .bind(status.as_str())
        .bind(to_db_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage("list", e))?;

        rows.iter().map(decode_row).collect()
    }
}

#[async_trait]
impl RetryStore for PostgresRetryStore {
    #[instrument(
        skip(self, envelope, error, policy),
        fields(aggregate_id = %envelope.aggregate_id(), version = envelope.version()),
        err
    )]
    async fn record_failure(
        &self,
        envelope: &EventEnvelope,
        error: &str,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, RetryStoreError> {
        let record = RetryRecord::first_failure(envelope, error, policy, now)
            .map_err(|e| RetryStoreError::Encode(e.to_string()))?;

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO projection_retries ({COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL, NULL, $11, $12)
            ON CONFLICT (aggregate_id, version) DO NOTHING
            RETURNING {COLUMNS}
            "#
        ))
        .bind(record.id.0)
        .bind(record.aggregate_id.as_str())
        .bind(to_db_u64(record.version)?)
        .bind(&record.event_type)
        .bind(&record.event_payload)
        .bind(to_db_u32(record.attempts)?)
        .bind(to_db_u32(record.max_attempts)?)
        .bind(&record.last_error)
        .bind(record.next_retry_at)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage("record_failure", e))?;

        if let Some(row) = inserted {
            return decode_row(&row);
        }

        self.fetch_by_event(&record.aggregate_id, record.version)
            .await?
            .ok_or_else(|| RetryStoreError::Storage("retry record vanished after conflict".to_string()))
    }

    #[instrument(skip(self), err)]
    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<RetryRecord>, RetryStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE projection_retries AS r
            SET claimed_by = $1, claim_expires_at = $3
            FROM (
                SELECT id FROM projection_retries
                WHERE status = 'pending'
                  AND next_retry_at <= $2
                  AND (claim_expires_at IS NULL OR claim_expires_at <= $2)
                ORDER BY next_retry_at, id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            ) AS due
            WHERE r.id = due.id
            RETURNING {}
            "#,
            COLUMNS.split(", ").map(|c| format!("r.{c}")).collect::<Vec<_>>().join(", ")
        ))
        .bind(owner)
        .bind(now)
        .bind(lease_expiry(now, lease))
        .bind(to_db_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| storage("claim_due", e))?;

        let mut claimed = rows.iter().map(decode_row).collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by_key(|r| (r.next_retry_at, r.id));
        Ok(claimed)
    }

    #[instrument(skip(self), fields(retry_id = %id), err)]
    async fn renew_claim(
        &self,
        id: RetryId,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, RetryStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE projection_retries
            SET claim_expires_at = $4
            WHERE id = $1 AND claimed_by = $2 AND status = 'pending' AND claim_expires_at > $3
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .bind(now)
        .bind(lease_expiry(now, lease))
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("renew_claim", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(retry_id = %id), err)]
    async fn complete(&self, id: RetryId, owner: &str) -> Result<bool, RetryStoreError> {
        let result = sqlx::query(
            "DELETE FROM projection_retries WHERE id = $1 AND claimed_by = $2 AND status = 'pending'",
        )
        .bind(id.0)
        .bind(owner)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("complete", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error), fields(retry_id = %id), err)]
    async fn reschedule(
        &self,
        id: RetryId,
        owner: &str,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RetryStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE projection_retries
            SET attempts = $3, next_retry_at = $4, last_error = $5, updated_at = $6,
                claimed_by = NULL, claim_expires_at = NULL
            WHERE id = $1 AND claimed_by = $2 AND status = 'pending'
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .bind(to_db_u32(attempts)?)
        .bind(next_retry_at)
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("reschedule", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error), fields(retry_id = %id), err)]
    async fn dead_letter(
        &self,
        id: RetryId,
        owner: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RetryStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE projection_retries
            SET status = 'dead_lettered', attempts = $3, last_error = $4, updated_at = $5,
                claimed_by = NULL, claim_expires_at = NULL
            WHERE id = $1 AND claimed_by = $2 AND status = 'pending'
            "#,
        )
        .bind(id.0)
        .bind(owner)
        .bind(to_db_u32(attempts)?)
        .bind(error)
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| storage("dead_letter", e))?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: RetryId) -> Result<Option<RetryRecord>, RetryStoreError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM projection_retries WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| storage("get", e))?;

        row.map(|r| decode_row(&r)).transpose()
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        self.fetch_list(RetryStatus::Pending, "next_retry_at ASC, id ASC", limit)
            .await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        self.fetch_list(RetryStatus::DeadLettered, "updated_at DESC, id DESC", limit)
            .await
    }

    async fn stats(&self) -> Result<RetryStats, RetryStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'dead_lettered') AS dead_lettered,
                COUNT(*) FILTER (WHERE status = 'pending' AND claim_expires_at > NOW()) AS claimed
            FROM projection_retries
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| storage("stats", e))?;

        let count = |column: &str| -> Result<u64, RetryStoreError> {
            let n: i64 = row.try_get(column).map_err(|e| storage("stats", e))?;
            Ok(n.max(0) as u64)
        };

        Ok(RetryStats {
            pending: count("pending")?,
            dead_lettered: count("dead_lettered")?,
            claimed: count("claimed")?,
        })
    }

    #[instrument(skip(self), fields(retry_id = %id), err)]
    async fn requeue_dead_letter(&self, id: RetryId, now: DateTime<Utc>) -> Result<RetryRecord, RetryStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE projection_retries
            SET status = 'pending', attempts = 1, next_retry_at = $2, updated_at = $2,
                claimed_by = NULL, claim_expires_at = NULL
            WHERE id = $1 AND status = 'dead_lettered'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.0)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| storage("requeue_dead_letter", e))?;

        if let Some(row) = row {
            return decode_row(&row);
        }

        match self.get(id).await? {
            Some(record) => Err(RetryStoreError::InvalidState {
                id,
                status: record.status,
            }),
            None => Err(RetryStoreError::NotFound(id)),
        }
    }

    #[instrument(skip(self), fields(retry_id = %id), err)]
    async fn delete(&self, id: RetryId) -> Result<bool, RetryStoreError> {
        let result = sqlx::query("DELETE FROM projection_retries WHERE id = $1")
            .bind(id.0)
            .execute(&*self.pool)
            .await
            .map_err(|e| storage("delete", e))?;

        Ok(result.rows_affected() > 0)
    }
}

fn storage(operation: &str, err: sqlx::Error) -> RetryStoreError {
    RetryStoreError::Storage(format!("sqlx error in {operation}: {err}"))
}

fn to_db_u64(value: u64) -> Result<i64, RetryStoreError> {
    i64::try_from(value).map_err(|_| RetryStoreError::Storage(format!("value {value} out of range")))
}

fn to_db_u32(value: u32) -> Result<i32, RetryStoreError> {
    i32::try_from(value).map_err(|_| RetryStoreError::Storage(format!("value {value} out of range")))
}

fn to_db_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn decode_row(row: &PgRow) -> Result<RetryRecord, RetryStoreError> {
    RetryRecordRow::from_row(row)
        .map_err(|e| RetryStoreError::Storage(format!("failed to deserialize retry row: {e}")))?
        .try_into()
}

#[derive(Debug)]
struct RetryRecordRow {
    id: Uuid,
    aggregate_id: String,
    version: i64,
    event_type: String,
    event_payload: Vec<u8>,
    attempts: i32,
    max_attempts: i32,
    last_error: String,
    next_retry_at: DateTime<Utc>,
    status: String,
    claimed_by: Option<String>,
    claim_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for RetryRecordRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(RetryRecordRow {
            id: row.try_get("id")?,
            aggregate_id: row.try_get("aggregate_id")?,
            version: row.try_get("version")?,
            event_type: row.try_get("event_type")?,
            event_payload: row.try_get("event_payload")?,
            attempts: row.try_get("attempts")?,
            max_attempts: row.try_get("max_attempts")?,
            last_error: row.try_get("last_error")?,
            next_retry_at: row.try_get("next_retry_at")?,
            status: row.try_get("status")?,
            claimed_by: row.try_get("claimed_by")?,
            claim_expires_at: row.try_get("claim_expires_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<RetryRecordRow> for RetryRecord {
    type Error = RetryStoreError;

    fn try_from(row: RetryRecordRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let invalid = |what: &str| RetryStoreError::Storage(format!("stored {what} invalid for retry {id}"));

        Ok(RetryRecord {
            id: RetryId::from_uuid(id),
            aggregate_id: AggregateId::new(row.aggregate_id).map_err(|_| invalid("aggregate_id"))?,
            version: u64::try_from(row.version).map_err(|_| invalid("version"))?,
            event_type: row.event_type,
            event_payload: row.event_payload,
            attempts: u32::try_from(row.attempts).map_err(|_| invalid("attempts"))?,
            max_attempts: u32::try_from(row.max_attempts).map_err(|_| invalid("max_attempts"))?,
            last_error: row.last_error,
            next_retry_at: row.next_retry_at,
            status: RetryStatus::parse(&row.status).ok_or_else(|| invalid("status"))?,
            claimed_by: row.claimed_by,
            claim_expires_at: row.claim_expires_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
