use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use chronicle_core::AggregateId;

use super::r#trait::{EventStore, EventStoreError, NewEvent, StoredEvent};

type Stream = Arc<Mutex<Vec<StoredEvent>>>;

/// In-memory append-only event store.
///
/// Each aggregate stream has its own lock; the outer map lock is only held to
/// find or create a stream, so appends on different aggregates never wait on
/// each other's version check.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<AggregateId, Stream>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of aggregates with at least one stored event.
    pub fn stream_count(&self) -> usize {
        self.streams.read().map(|s| s.len()).unwrap_or(0)
    }

    fn existing_stream(&self, aggregate_id: &AggregateId) -> Result<Option<Stream>, EventStoreError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(streams.get(aggregate_id).cloned())
    }

    fn stream_for_append(&self, aggregate_id: &AggregateId) -> Result<Stream, EventStoreError> {
        if let Some(stream) = self.existing_stream(aggregate_id)? {
            return Ok(stream);
        }

        let mut streams = self
            .streams
            .write()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(streams.entry(aggregate_id.clone()).or_default().clone())
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate_id: &AggregateId,
        expected_version: u64,
        events: Vec<NewEvent>,
    ) -> Result<Vec<StoredEvent>, EventStoreError> {
        let stream = self.stream_for_append(aggregate_id)?;
        let mut stream = stream
            .lock()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;

        let current = stream.len() as u64;
        if current != expected_version {
            return Err(EventStoreError::Concurrency(format!(
                "aggregate {aggregate_id}: expected version {expected_version}, found {current}"
            )));
        }
        if events.is_empty() {
            return Ok(vec![]);
        }

        // Versions are assigned before anything is pushed; a batch is all-or-nothing.
        let committed: Vec<StoredEvent> = events
            .into_iter()
            .zip(current + 1..)
            .map(|(e, version)| StoredEvent {
                aggregate_id: aggregate_id.clone(),
                version,
                event_type: e.event_type,
                payload: e.payload,
                occurred_at: e.occurred_at,
            })
            .collect();

        stream.extend(committed.iter().cloned());
        Ok(committed)
    }

    async fn load(&self, aggregate_id: &AggregateId) -> Result<Vec<StoredEvent>, EventStoreError> {
        let Some(stream) = self.existing_stream(aggregate_id)? else {
            return Ok(vec![]);
        };

        let stream = stream
            .lock()
            .map_err(|_| EventStoreError::Storage("lock poisoned".to_string()))?;
        Ok(stream.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;

    fn id(raw: &str) -> AggregateId {
        AggregateId::new(raw).unwrap()
    }

    fn new_event(tag: &str) -> NewEvent {
        NewEvent {
            event_type: format!("test.{tag}"),
            payload: format!("{{\"tag\":\"{tag}\"}}").into_bytes(),
            occurred_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn load_unknown_aggregate_is_empty() {
        let store = InMemoryEventStore::new();
        assert!(store.load(&id("nope")).await.unwrap().is_empty());
        assert_eq!(store.stream_count(), 0);
    }

    #[tokio::test]
    async fn appends_assign_gapless_versions_in_order() {
        let store = InMemoryEventStore::new();
        let a = id("A1");

        store.append(&a, 0, vec![new_event("a"), new_event("b")]).await.unwrap();
        let committed = store.append(&a, 2, vec![new_event("c")]).await.unwrap();
        assert_eq!(committed[0].version, 3);

        let loaded = store.load(&a).await.unwrap();
        let versions: Vec<u64> = loaded.iter().map(|e| e.version).collect();
        let types: Vec<&str> = loaded.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(versions, vec![1, 2, 3]);
        assert_eq!(types, vec!["test.a", "test.b", "test.c"]);
    }

    #[tokio::test]
    async fn stale_expected_version_conflicts_and_writes_nothing() {
        let store = InMemoryEventStore::new();
        let a = id("A1");
        store.append(&a, 0, vec![new_event("a")]).await.unwrap();

        for stale in [0, 2, 7] {
            let err = store
                .append(&a, stale, vec![new_event("x"), new_event("y")])
                .await
                .unwrap_err();
            assert!(err.is_concurrency(), "expected conflict for {stale}, got {err:?}");
        }

        assert_eq!(store.load(&a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_batch_writes_nothing_but_is_version_checked() {
        let store = InMemoryEventStore::new();
        let a = id("A1");
        assert!(store.append(&a, 0, vec![]).await.unwrap().is_empty());
        assert!(store.load(&a).await.unwrap().is_empty());

        let err = store.append(&a, 7, vec![]).await.unwrap_err();
        assert!(err.is_concurrency());
    }

    #[tokio::test]
    async fn streams_are_independent() {
        let store = InMemoryEventStore::new();
        store.append(&id("A1"), 0, vec![new_event("a")]).await.unwrap();
        store.append(&id("B2"), 0, vec![new_event("b")]).await.unwrap();

        assert_eq!(store.load(&id("A1")).await.unwrap()[0].event_type, "test.a");
        assert_eq!(store.load(&id("B2")).await.unwrap()[0].version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_at_same_version_have_exactly_one_winner() {
        let store = Arc::new(InMemoryEventStore::new());
        let a = id("A1");

        let mut tasks = Vec::new();
        for n in 0..16 {
            let store = store.clone();
            let a = a.clone();
            tasks.push(tokio::spawn(async move {
                store.append(&a, 0, vec![new_event(&format!("e{n}"))]).await
            }));
        }

        let mut wins = 0;
        let mut conflicts = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => wins += 1,
                Err(e) if e.is_concurrency() => conflicts += 1,
                Err(e) => panic!("unexpected error: {e:?}"),
            }
        }

        assert_eq!(wins, 1);
        assert_eq!(conflicts, 15);
        assert_eq!(store.load(&a).await.unwrap().len(), 1);
    }
}
