use async_trait::async_trait;
use tracing::debug;

use chronicle_events::{EventEnvelope, EventRegistry};
use chronicle_orders::{OrderEvent, OrderId, OrderStatus};

use super::{ProjectionApplier, ProjectionError};
use crate::read_model::{OrderView, OrderViewStore};

/// Maintains `OrderView { status, version }` per order.
#[derive(Debug)]
pub struct OrderStatusProjection<S> {
    store: S,
    registry: EventRegistry<OrderEvent>,
}

impl<S> OrderStatusProjection<S>
where
    S: OrderViewStore,
{
    pub fn new(store: S, registry: EventRegistry<OrderEvent>) -> Self {
        Self { store, registry }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

#[async_trait]
impl<S> ProjectionApplier for OrderStatusProjection<S>
where
    S: OrderViewStore,
{
    fn name(&self) -> &str {
        "orders.status"
    }

    async fn apply(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        let event = envelope
            .decode_with(&self.registry)
            .map_err(|e| ProjectionError::Permanent(e.to_string()))?;

        if event.order_id().as_aggregate_id() != envelope.aggregate_id() {
            return Err(ProjectionError::Permanent(format!(
                "event order_id {} does not match envelope aggregate_id {}",
                event.order_id(),
                envelope.aggregate_id()
            )));
        }

        let status = match &event {
            OrderEvent::Created(_) => OrderStatus::Created,
            OrderEvent::Paid(_) => OrderStatus::Paid,
        };

        let view = OrderView {
            order_id: OrderId::new(envelope.aggregate_id().clone()),
            status,
            version: envelope.version(),
            updated_at: envelope.occurred_at(),
        };

        let changed = self
            .store
            .upsert_if_newer(view)
            .await
            .map_err(|e| ProjectionError::Transient(e.to_string()))?;

        if !changed {
            debug!(
                aggregate_id = %envelope.aggregate_id(),
                version = envelope.version(),
                "stale or duplicate event skipped"
            );
        }
        Ok(())
    }
}
