//! Aggregate reconstruction by event replay.
//!
//! ```text
//! load(aggregate_id) → validate versions 1..=n → registry.decode → apply → check version() == n
//! ```
//!
//! Replay is deterministic and side-effect free; the only IO is the ledger load.

use thiserror::Error;
use tracing::instrument;

use chronicle_core::{Aggregate, AggregateId};
use chronicle_events::{EventRegistry, RegistryError};

use crate::event_store::{EventStore, EventStoreError, StoredEvent};

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    /// An event type the aggregate does not know, or a payload that won't decode.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// The ledger returned a stream that breaks its own guarantees.
    #[error("corrupt stream for aggregate {aggregate_id}: {reason}")]
    CorruptStream { aggregate_id: AggregateId, reason: String },
}

/// Rebuilds aggregates from the ledger.
#[derive(Debug, Clone)]
pub struct Replayer<S> {
    store: S,
}

impl<S> Replayer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S> Replayer<S>
where
    S: EventStore,
{
    /// Load the full history of `aggregate_id` and fold it into a fresh aggregate.
    ///
    /// An unknown id yields the aggregate exactly as `make_aggregate` built it
    /// (version 0).
    #[instrument(skip(self, make_aggregate, registry), fields(aggregate_id = %aggregate_id), err)]
    pub async fn rebuild<A>(
        &self,
        aggregate_id: &AggregateId,
        make_aggregate: impl FnOnce(&AggregateId) -> A,
        registry: &EventRegistry<A::Event>,
    ) -> Result<A, ReplayError>
    where
        A: Aggregate,
    {
        let history = self.store.load(aggregate_id).await?;
        fold_history(aggregate_id, make_aggregate(aggregate_id), registry, &history)
    }
}

/// Fold a loaded stream into `aggregate`.
pub fn fold_history<A>(
    aggregate_id: &AggregateId,
    mut aggregate: A,
    registry: &EventRegistry<A::Event>,
    history: &[StoredEvent],
) -> Result<A, ReplayError>
where
    A: Aggregate,
{
    let corrupt = |reason: String| ReplayError::CorruptStream {
        aggregate_id: aggregate_id.clone(),
        reason,
    };

    for (expected, stored) in (1u64..).zip(history) {
        if &stored.aggregate_id != aggregate_id {
            return Err(corrupt(format!(
                "event at version {} belongs to {}",
                stored.version, stored.aggregate_id
            )));
        }
        if stored.version != expected {
            return Err(corrupt(format!("expected version {expected}, found {}", stored.version)));
        }

        let event = registry.decode(&stored.event_type, &stored.payload)?;
        aggregate.apply(&event);
    }

    let n = history.len() as u64;
    if aggregate.version() != n {
        return Err(corrupt(format!(
            "aggregate reports version {} after replaying {n} events",
            aggregate.version()
        )));
    }

    Ok(aggregate)
}
