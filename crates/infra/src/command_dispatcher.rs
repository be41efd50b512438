//! Command execution pipeline (application-level orchestration).
//!
//! ```text
//! Command
//!   ↓
//! 1. Rebuild aggregate (load history, fold through the registry)
//!   ↓
//! 2. Handle command (pure decision logic, produces events)
//!   ↓
//! 3. Append to the ledger at the rebuilt version (optimistic concurrency)
//!   ↓          └─ conflict: reload and re-run from 1, up to `max_conflict_retries`
//! 4. Publish committed envelopes (bounded by `publish_timeout`)
//! ```
//!
//! ## Dual-write gap
//!
//! Steps 3 and 4 are two independent writes. If the append commits and the
//! publish fails or times out, the events are durable but consumers have not
//! seen them. `DispatchError::Publish` carries the committed events so the
//! caller can republish; consumers are idempotent per `(aggregate_id, version)`
//! so a duplicate publish is harmless. Closing the gap entirely needs a
//! transactional outbox, which this pipeline does not have.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use chronicle_core::{Aggregate, AggregateId, DomainError};
use chronicle_events::{Command, EventPublisher, EventRegistry, PublishError};

use crate::event_store::{EventStore, EventStoreError, NewEvent, StoredEvent};
use crate::replay::{ReplayError, Replayer};

#[derive(Debug, Error)]
pub enum DispatchError {
    /// Still conflicting after every allowed retry.
    #[error("concurrency conflict: {0}")]
    Concurrency(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    /// The command conflicts with current state (e.g. creating an existing order).
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("not found")]
    NotFound,

    #[error("failed to rebuild aggregate: {0}")]
    Replay(ReplayError),

    #[error("event store error: {0}")]
    Store(EventStoreError),

    #[error("failed to encode event: {0}")]
    Encode(String),

    /// Publication failed after a successful append. `committed` is durable.
    #[error("publish failed after {} events were committed: {source}", .committed.len())]
    Publish {
        committed: Vec<StoredEvent>,
        #[source]
        source: PublishError,
    },
}

impl From<DomainError> for DispatchError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) => DispatchError::Validation(msg),
            DomainError::InvalidId(msg) => DispatchError::Validation(msg),
            DomainError::InvariantViolation(msg) => DispatchError::InvariantViolation(msg),
            DomainError::Conflict(msg) => DispatchError::Conflict(msg),
            DomainError::NotFound => DispatchError::NotFound,
        }
    }
}

impl From<EventStoreError> for DispatchError {
    fn from(value: EventStoreError) -> Self {
        match value {
            EventStoreError::Concurrency(msg) => DispatchError::Concurrency(msg),
            other => DispatchError::Store(other),
        }
    }
}

impl From<ReplayError> for DispatchError {
    fn from(value: ReplayError) -> Self {
        match value {
            ReplayError::Store(e) => e.into(),
            other => DispatchError::Replay(other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Reload-and-retry attempts after the first conflicting append.
    pub max_conflict_retries: u32,
    pub publish_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            publish_timeout: Duration::from_secs(5),
        }
    }
}

/// Reusable command execution engine for event-sourced aggregates.
///
/// The ledger is the only lock: two dispatchers may handle commands for the
/// same aggregate concurrently, and the loser of the append re-runs the
/// command against the winner's state.
#[derive(Debug)]
pub struct CommandDispatcher<S, P> {
    replayer: Replayer<S>,
    publisher: P,
    config: DispatchConfig,
}

impl<S, P> CommandDispatcher<S, P> {
    pub fn new(store: S, publisher: P) -> Self {
        Self::with_config(store, publisher, DispatchConfig::default())
    }

    pub fn with_config(store: S, publisher: P, config: DispatchConfig) -> Self {
        Self {
            replayer: Replayer::new(store),
            publisher,
            config,
        }
    }

    pub fn replayer(&self) -> &Replayer<S> {
        &self.replayer
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }
}

impl<S, P> CommandDispatcher<S, P>
where
    S: EventStore,
    P: EventPublisher,
{
    /// Run `command` against its target aggregate and publish what it produced.
    ///
    /// Returns the committed events (empty if the command decided nothing).
    #[instrument(
        skip(self, command, make_aggregate, registry),
        fields(aggregate_id = %command.target_aggregate_id()),
        err
    )]
    pub async fn dispatch<A>(
        &self,
        command: A::Command,
        make_aggregate: impl Fn(&AggregateId) -> A,
        registry: &EventRegistry<A::Event>,
    ) -> Result<Vec<StoredEvent>, DispatchError>
    where
        A: Aggregate<Error = DomainError>,
        A::Command: Command,
        A::Event: chronicle_events::Event,
    {
        let aggregate_id = command.target_aggregate_id().clone();
        let mut conflicts = 0u32;

        let committed = loop {
            let aggregate = self
                .replayer
                .rebuild(&aggregate_id, &make_aggregate, registry)
                .await?;

            let decided = aggregate.handle(&command)?;
            if decided.is_empty() {
                return Ok(vec![]);
            }

            let new_events = decided
                .iter()
                .map(NewEvent::from_typed)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| DispatchError::Encode(e.to_string()))?;

            match self
                .replayer
                .store()
                .append(&aggregate_id, aggregate.version(), new_events)
                .await
            {
                Ok(committed) => break committed,
                Err(e) if e.is_concurrency() && conflicts < self.config.max_conflict_retries => {
                    conflicts += 1;
                    debug!(attempt = conflicts, error = %e, "append conflicted, reloading");
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.publish_all(&committed)
            .await
            .map_err(|source| DispatchError::Publish {
                committed: committed.clone(),
                source,
            })?;

        Ok(committed)
    }

    async fn publish_all(&self, committed: &[StoredEvent]) -> Result<(), PublishError> {
        for stored in committed {
            let envelope = stored.to_envelope();
            let timeout = self.config.publish_timeout;

            match tokio::time::timeout(timeout, self.publisher.publish(&envelope)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(version = stored.version, error = %e, "publish failed after append");
                    return Err(e);
                }
                Err(_) => {
                    warn!(version = stored.version, ?timeout, "publish timed out after append");
                    return Err(PublishError::Timeout(timeout));
                }
            }
        }
        Ok(())
    }
}
