//! Projections (read model builders).
//!
//! Projections consume committed envelopes and update a query-optimized read
//! model. They must be:
//! - **Idempotent**: applying the same `(aggregate_id, version)` twice leaves
//!   the read model unchanged after the first application
//! - **Order-tolerant**: an older version arriving late is a no-op
//!
//! Failures are classified but never retried here; the caller routes every
//! failure to the retry ledger.

pub mod order_status;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use chronicle_events::EventEnvelope;

pub use order_status::OrderStatusProjection;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    /// The read store is unreachable or timed out; a later attempt may succeed.
    #[error("transient projection failure: {0}")]
    Transient(String),

    /// The envelope can never be applied as-is (unknown type, bad payload).
    #[error("permanent projection failure: {0}")]
    Permanent(String),
}

impl ProjectionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProjectionError::Transient(_))
    }
}

#[async_trait]
pub trait ProjectionApplier: Send + Sync {
    /// Stable name used in logs and as the sweeper's default owner prefix.
    fn name(&self) -> &str;

    async fn apply(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError>;
}

#[async_trait]
impl<A> ProjectionApplier for Arc<A>
where
    A: ProjectionApplier + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn apply(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        (**self).apply(envelope).await
    }
}
