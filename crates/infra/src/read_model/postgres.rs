//! Postgres-backed order read model (`order_views`).

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use chronicle_core::AggregateId;
use chronicle_orders::{OrderId, OrderStatus};

use super::{OrderView, OrderViewStore, ReadModelError};

/// Order read model stored in its own database (it may live apart from the ledger).
#[derive(Debug, Clone)]
pub struct PostgresOrderViewStore {
    pool: Arc<PgPool>,
}

impl PostgresOrderViewStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl OrderViewStore for PostgresOrderViewStore {
    #[instrument(skip(self, view), fields(order_id = %view.order_id, version = view.version), err)]
    async fn upsert_if_newer(&self, view: OrderView) -> Result<bool, ReadModelError> {
        let version = i64::try_from(view.version)
            .map_err(|_| ReadModelError::Storage(format!("version {} out of range", view.version)))?;

        let result = sqlx::query(
            r#"
            INSERT INTO order_views (order_id, status, version, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (order_id) DO UPDATE
            SET status = EXCLUDED.status,
                version = EXCLUDED.version,
                updated_at = EXCLUDED.updated_at
            WHERE order_views.version < EXCLUDED.version
            "#,
        )
        .bind(view.order_id.as_aggregate_id().as_str())
        .bind(view.status.as_str())
        .bind(version)
        .bind(view.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| ReadModelError::Storage(format!("upsert order view: {e}")))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(order_id = %order_id), err)]
    async fn find_by_id(&self, order_id: &OrderId) -> Result<Option<OrderView>, ReadModelError> {
        let row = sqlx::query(
            r#"
            SELECT order_id, status, version, updated_at
            FROM order_views
            WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_aggregate_id().as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| ReadModelError::Storage(format!("find order view: {e}")))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let invalid = |what: &str, e: String| ReadModelError::Storage(format!("stored {what} invalid: {e}"));

        let id: String = row.try_get("order_id").map_err(|e| invalid("order_id", e.to_string()))?;
        let status: String = row.try_get("status").map_err(|e| invalid("status", e.to_string()))?;
        let version: i64 = row.try_get("version").map_err(|e| invalid("version", e.to_string()))?;
        let updated_at: DateTime<Utc> = row
            .try_get("updated_at")
            .map_err(|e| invalid("updated_at", e.to_string()))?;

        Ok(Some(OrderView {
            order_id: OrderId::new(AggregateId::new(id).map_err(|e| invalid("order_id", e.to_string()))?),
            status: status
                .parse::<OrderStatus>()
                .map_err(|e| invalid("status", e.to_string()))?,
            version: u64::try_from(version).map_err(|e| invalid("version", e.to_string()))?,
            updated_at,
        }))
    }
}
