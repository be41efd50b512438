//! Order read model storage.
//!
//! The read model is written only by projections and is eventually consistent
//! with the ledger. Writes are conditional on the event version, so replays and
//! late duplicates are no-ops.

pub mod in_memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use chronicle_orders::{OrderId, OrderStatus};

pub use in_memory::InMemoryOrderViewStore;
pub use postgres::PostgresOrderViewStore;

/// Denormalized order row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderView {
    pub order_id: OrderId,
    pub status: OrderStatus,
    /// Version of the last event applied to this row.
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ReadModelError {
    #[error("read model storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait OrderViewStore: Send + Sync {
    /// Write `view` only if no row exists or the stored version is older.
    ///
    /// Returns whether the row changed.
    async fn upsert_if_newer(&self, view: OrderView) -> Result<bool, ReadModelError>;

    async fn find_by_id(&self, order_id: &OrderId) -> Result<Option<OrderView>, ReadModelError>;
}

#[async_trait]
impl<S> OrderViewStore for Arc<S>
where
    S: OrderViewStore + ?Sized,
{
    async fn upsert_if_newer(&self, view: OrderView) -> Result<bool, ReadModelError> {
        (**self).upsert_if_newer(view).await
    }

    async fn find_by_id(&self, order_id: &OrderId) -> Result<Option<OrderView>, ReadModelError> {
        (**self).find_by_id(order_id).await
    }
}
