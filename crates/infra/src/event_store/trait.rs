use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use chronicle_core::AggregateId;
use chronicle_events::{Event, EventEnvelope};

/// An event ready to be appended to a stream (not yet assigned a version).
///
/// ## Event Lifecycle
///
/// 1. **Domain event**: produced by the aggregate's `handle()`
/// 2. **NewEvent**: discriminator + serialized payload
/// 3. **StoredEvent**: persisted with an assigned version
/// 4. **EventEnvelope**: published for consumers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEvent {
    pub event_type: String,
    pub payload: Vec<u8>,
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    /// Capture a typed domain event's discriminator, timestamp, and payload bytes.
    pub fn from_typed<E>(event: &E) -> Result<Self, EventStoreError>
    where
        E: Event,
    {
        let payload = event
            .encode_payload()
            .map_err(|e| EventStoreError::InvalidAppend(format!("payload serialization failed: {e}")))?;

        Ok(Self {
            event_type: event.event_type().to_string(),
            payload,
            occurred_at: event.occurred_at(),
        })
    }
}

/// A persisted event record.
///
/// Versions are:
/// - **1-based and gapless** per aggregate
/// - **strictly increasing** in append order
/// - **immutable** once assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub aggregate_id: AggregateId,
    pub version: u64,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub occurred_at: DateTime<Utc>,
}

impl StoredEvent {
    /// Convert a stored event into an envelope for publication.
    pub fn to_envelope(&self) -> EventEnvelope {
        EventEnvelope::new(
            self.event_type.clone(),
            self.aggregate_id.clone(),
            self.version,
            self.occurred_at,
            self.payload.clone(),
        )
    }
}

/// Event store operation error.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// `expected_version` did not match the stored count; nothing was written.
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    /// Transient backend failure (connection, IO, timeouts).
    #[error("storage error: {0}")]
    Storage(String),
}

impl EventStoreError {
    pub fn is_concurrency(&self) -> bool {
        matches!(self, EventStoreError::Concurrency(_))
    }
}

/// Append-only, per-aggregate versioned event ledger.
///
/// ## Append Semantics
///
/// `append()`:
/// - Requires `expected_version` to equal the number of events already stored
///   for `aggregate_id` (0 for a new aggregate)
/// - Assigns versions `expected_version + 1 ..= expected_version + n` in batch order
/// - Persists the whole batch or nothing
/// - Fails with `Concurrency` on mismatch, without writing
/// - An empty batch writes nothing but is still version-checked
///
/// The check-and-append must be linearizable per aggregate id. Appends for
/// different aggregate ids must not contend with each other.
///
/// ## Load Semantics
///
/// `load()` returns the stream in ascending version order, or an empty vector
/// for an unknown aggregate.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError>;

    async fn load(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).append(aggregate_id, expected_version, events).await
    }

    async fn load(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        (**self).load(aggregate_id).await
    }
}
