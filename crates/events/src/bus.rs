//! Event publishing/subscription abstraction (mechanics only).
//!
//! Events are **stored first** (in the ledger), then **published**:
//!
//! ```text
//! Command → Ledger (append) → Publisher → Consumers
//!                                            └─ Projection worker → Read model
//!                                                     └─ (failure) → Retry ledger
//! ```
//!
//! ## Delivery
//!
//! - **At-least-once**: a consumer may see the same envelope more than once and
//!   must be idempotent per `(aggregate_id, version)`.
//! - **Per-aggregate order**: implementations key messages by aggregate id so all
//!   events for one aggregate arrive in ledger order. Nothing is promised across
//!   aggregates.
//! - **No internal retry**: `publish` surfaces transport failures to the caller.
//!   An appended-but-unpublished event is a known gap (ledger and broker are two
//!   separate writes).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

use crate::envelope::EventEnvelope;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("publisher closed")]
    Closed,
}

/// A subscription to the in-process event stream.
///
/// Each subscription receives a copy of every envelope published after it was
/// created (broadcast semantics). Intended for a single consuming task.
#[derive(Debug)]
pub struct Subscription {
    receiver: UnboundedReceiver<EventEnvelope>,
}

impl Subscription {
    pub fn new(receiver: UnboundedReceiver<EventEnvelope>) -> Self {
        Self { receiver }
    }

    /// Wait for the next envelope. `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.receiver.recv().await
    }

    /// Try to receive an envelope without waiting.
    pub fn try_recv(&mut self) -> Result<EventEnvelope, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Wait up to `timeout` for the next envelope.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<EventEnvelope> {
        tokio::time::timeout(timeout, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

/// Delivers committed envelopes to a single logical topic.
///
/// Implementations must use the aggregate id as the ordering key and carry
/// `event_type` as metadata next to the encoded envelope.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError>;
}

#[async_trait]
impl<P> EventPublisher for Arc<P>
where
    P: EventPublisher + ?Sized,
{
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        (**self).publish(envelope).await
    }
}
