use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use chronicle_orders::OrderId;

use super::{OrderView, OrderViewStore, ReadModelError};

/// In-memory order read model for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryOrderViewStore {
    rows: RwLock<HashMap<OrderId, OrderView>>,
}

impl InMemoryOrderViewStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl OrderViewStore for InMemoryOrderViewStore {
    async fn upsert_if_newer(&self, view: OrderView) -> Result<bool, ReadModelError> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| ReadModelError::Storage("lock poisoned".to_string()))?;

        match rows.get(&view.order_id) {
            Some(existing) if existing.version >= view.version => Ok(false),
            _ => {
                rows.insert(view.order_id.clone(), view);
                Ok(true)
            }
        }
    }

    async fn find_by_id(&self, order_id: &OrderId) -> Result<Option<OrderView>, ReadModelError> {
        let rows = self
            .rows
            .read()
            .map_err(|_| ReadModelError::Storage("lock poisoned".to_string()))?;
        Ok(rows.get(order_id).cloned())
    }
}
