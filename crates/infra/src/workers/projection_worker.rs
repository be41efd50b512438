use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use chronicle_events::EventEnvelope;

use super::source::{Delivery, EventSource};
use crate::projections::{ProjectionApplier, ProjectionError};
use crate::retry::{BackoffPolicy, DeadLetterNotice, DeadLetterSink, RetryId, RetryStore};

/// Projection worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Maximum deliveries pulled per read
    pub batch_size: usize,
    /// How long one read may block waiting for messages
    pub poll_wait: Duration,
    /// Bound on a single projection call
    pub projection_timeout: Duration,
    /// Pause after a failed read
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "projection-worker".to_string(),
            batch_size: 32,
            poll_wait: Duration::from_millis(250),
            projection_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_projection_timeout(mut self, timeout: Duration) -> Self {
        self.projection_timeout = timeout;
        self
    }

    pub fn with_poll_wait(mut self, poll_wait: Duration) -> Self {
        self.poll_wait = poll_wait;
        self
    }
}

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Projection succeeded; acked.
    Applied,
    /// Projection failed; handed to the retry ledger and acked.
    Deferred(RetryId),
    /// The message is not a valid envelope; dead-lettered and acked.
    Poisoned,
    /// Could not be handed off durably; left unacked for redelivery.
    Unacked,
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            warn!(error = %e, "projection worker task ended abnormally");
        }
    }
}

/// Consumes envelopes from an `EventSource` and applies one projection.
///
/// - Messages are processed one at a time, in delivery order
/// - A failed projection is recorded in the retry ledger before the message is
///   acked, so no failure is lost between the broker and the ledger
/// - The projection must be idempotent (at-least-once delivery)
pub struct ProjectionWorker<Src, A, R> {
    source: Src,
    applier: A,
    retries: R,
    policy: BackoffPolicy,
    config: WorkerConfig,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl<Src, A, R> ProjectionWorker<Src, A, R>
where
    Src: EventSource,
    A: ProjectionApplier,
    R: RetryStore,
{
    pub fn new(source: Src, applier: A, retries: R, policy: BackoffPolicy, config: WorkerConfig) -> Self {
        Self {
            source,
            applier,
            retries,
            policy,
            config,
            dead_letters: None,
        }
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    /// Handle a single delivery end to end, including the ack.
    pub async fn process(&self, delivery: &Delivery) -> DeliveryOutcome {
        let name = self.config.name.as_str();

        let envelope = match EventEnvelope::decode(&delivery.body) {
            Ok(envelope) => envelope,
            Err(e) => return self.poison(delivery, e.to_string()).await,
        };

        let error = match self.apply(&envelope).await {
            Ok(()) => {
                debug!(
                    worker = %name,
                    aggregate_id = %envelope.aggregate_id(),
                    version = envelope.version(),
                    "projection applied"
                );
                self.ack(delivery).await;
                return DeliveryOutcome::Applied;
            }
            Err(e) => e,
        };

        let record = match self
            .retries
            .record_failure(&envelope, &error.to_string(), &self.policy, Utc::now())
            .await
        {
            Ok(record) => record,
            Err(e) => {
                error!(
                    worker = %name,
                    aggregate_id = %envelope.aggregate_id(),
                    version = envelope.version(),
                    projection_error = %error,
                    error = %e,
                    "failed to record projection failure, leaving message unacked"
                );
                return self.release(delivery).await;
            }
        };

        warn!(
            worker = %name,
            retry_id = %record.id,
            aggregate_id = %envelope.aggregate_id(),
            version = envelope.version(),
            next_retry_at = %record.next_retry_at,
            error = %error,
            "projection failed, scheduled for retry"
        );

        if record.is_terminal() {
            // max_attempts == 1: there will be no retry.
            error!(worker = %name, retry_id = %record.id, "projection failed with no retries allowed, record dead-lettered");
            self.notify(&DeadLetterNotice::from_record(&record, Utc::now())).await;
        }

        self.ack(delivery).await;
        DeliveryOutcome::Deferred(record.id)
    }

    async fn apply(&self, envelope: &EventEnvelope) -> Result<(), ProjectionError> {
        match tokio::time::timeout(self.config.projection_timeout, self.applier.apply(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(ProjectionError::Transient(format!(
                "timed out after {:?}",
                self.config.projection_timeout
            ))),
        }
    }

    async fn poison(&self, delivery: &Delivery, error: String) -> DeliveryOutcome {
        error!(
            worker = %self.config.name,
            receipt = %delivery.receipt,
            event_type = ?delivery.event_type,
            error = %error,
            "undecodable message, dead-lettering"
        );

        let notice = DeadLetterNotice::undecodable(
            delivery.event_type.clone().unwrap_or_else(|| "unknown".to_string()),
            delivery.body.clone(),
            error,
            Utc::now(),
        );
        if !self.notify(&notice).await {
            return self.release(delivery).await;
        }

        self.ack(delivery).await;
        DeliveryOutcome::Poisoned
    }

    /// `false` if no sink is configured or the sink rejected the notice.
    async fn notify(&self, notice: &DeadLetterNotice) -> bool {
        let Some(sink) = &self.dead_letters else {
            warn!(worker = %self.config.name, "no dead-letter sink configured");
            return false;
        };
        match sink.notify(notice).await {
            Ok(()) => true,
            Err(e) => {
                warn!(worker = %self.config.name, error = %e, "dead-letter notification failed");
                false
            }
        }
    }

    async fn release(&self, delivery: &Delivery) -> DeliveryOutcome {
        if let Err(e) = self.source.release(delivery).await {
            warn!(worker = %self.config.name, receipt = %delivery.receipt, error = %e, "release failed");
        }
        DeliveryOutcome::Unacked
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.source.ack(delivery).await {
            // Redelivery is safe: the projection is idempotent and the retry
            // ledger keys records by (aggregate_id, version).
            warn!(worker = %self.config.name, receipt = %delivery.receipt, error = %e, "ack failed");
        }
    }
}

impl<Src, A, R> ProjectionWorker<Src, A, R>
where
    Src: EventSource + 'static,
    A: ProjectionApplier + 'static,
    R: RetryStore + 'static,
{
    /// Run the worker on the current tokio runtime until shut down.
    pub fn spawn(self) -> WorkerHandle {
        let shutdown = Arc::new(Notify::new());
        let join = tokio::spawn(self.run(shutdown.clone()));
        WorkerHandle { shutdown, join }
    }

    async fn run(self, shutdown: Arc<Notify>) {
        let name = self.config.name.clone();
        info!(worker = %name, projection = self.applier.name(), "projection worker started");

        loop {
            let batch = tokio::select! {
                _ = shutdown.notified() => break,
                batch = self.source.next_batch(self.config.batch_size, self.config.poll_wait) => batch,
            };

            match batch {
                Ok(deliveries) => {
                    let mut released = false;
                    for delivery in &deliveries {
                        if self.process(delivery).await == DeliveryOutcome::Unacked {
                            released = true;
                        }
                    }
                    // Released deliveries come straight back; give the ledger or sink time to recover.
                    if released {
                        tokio::select! {
                            _ = shutdown.notified() => break,
                            _ = tokio::time::sleep(self.config.error_backoff) => {}
                        }
                    }
                }
                Err(e) => {
                    warn!(worker = %name, error = %e, "failed to read from event source");
                    tokio::select! {
                        _ = shutdown.notified() => break,
                        _ = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                }
            }
        }

        info!(worker = %name, "projection worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::Utc;

    use chronicle_core::AggregateId;
    use chronicle_events::{Event, EventPublisher, InMemoryEventBus};
    use chronicle_orders::{OrderCreated, OrderEvent, OrderId, OrderStatus, order_registry};

    use super::*;
    use crate::projections::OrderStatusProjection;
    use crate::read_model::{InMemoryOrderViewStore, OrderViewStore};
    use crate::retry::{InMemoryDeadLetterSink, InMemoryRetryStore, RetryStoreError};
    use crate::workers::SubscriptionSource;

    struct Unavailable;

    #[async_trait]
    impl ProjectionApplier for Unavailable {
        fn name(&self) -> &str {
            "unavailable"
        }

        async fn apply(&self, _: &EventEnvelope) -> Result<(), ProjectionError> {
            Err(ProjectionError::Transient("read store down".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingSource {
        acked: std::sync::Mutex<Vec<String>>,
        released: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingSource {
        fn acked(&self) -> Vec<String> {
            self.acked.lock().unwrap().clone()
        }

        fn released(&self) -> Vec<String> {
            self.released.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EventSource for RecordingSource {
        async fn next_batch(&self, _: usize, _: Duration) -> Result<Vec<Delivery>, crate::workers::SourceError> {
            Ok(vec![])
        }

        async fn ack(&self, delivery: &Delivery) -> Result<(), crate::workers::SourceError> {
            self.acked.lock().unwrap().push(delivery.receipt.clone());
            Ok(())
        }

        async fn release(&self, delivery: &Delivery) -> Result<(), crate::workers::SourceError> {
            self.released.lock().unwrap().push(delivery.receipt.clone());
            Ok(())
        }
    }

    fn order_envelope(raw: &str) -> EventEnvelope {
        let event = OrderEvent::Created(OrderCreated {
            order_id: OrderId::new(AggregateId::new(raw).unwrap()),
            occurred_at: Utc::now(),
        });
        EventEnvelope::new(
            event.event_type(),
            AggregateId::new(raw).unwrap(),
            1,
            event.occurred_at(),
            event.encode_payload().unwrap(),
        )
    }

    fn delivery(envelope: &EventEnvelope) -> Delivery {
        Delivery {
            receipt: "1-0".to_string(),
            event_type: Some(envelope.event_type().to_string()),
            body: envelope.encode().unwrap(),
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(10), 3)
    }

    #[tokio::test]
    async fn successful_projection_is_acked() {
        let source = Arc::new(RecordingSource::default());
        let views = Arc::new(InMemoryOrderViewStore::new());
        let projection = OrderStatusProjection::new(views.clone(), order_registry().unwrap());
        let worker = ProjectionWorker::new(source.clone(), projection, InMemoryRetryStore::new(), policy(), WorkerConfig::default());

        let outcome = worker.process(&delivery(&order_envelope("A1"))).await;

        assert_eq!(outcome, DeliveryOutcome::Applied);
        assert_eq!(source.acked(), vec!["1-0".to_string()]);
        let id = OrderId::new(AggregateId::new("A1").unwrap());
        assert_eq!(views.find_by_id(&id).await.unwrap().unwrap().status, OrderStatus::Created);
    }

    #[tokio::test]
    async fn failed_projection_is_recorded_then_acked() {
        let source = Arc::new(RecordingSource::default());
        let retries = InMemoryRetryStore::arc();
        let worker = ProjectionWorker::new(source.clone(), Unavailable, retries.clone(), policy(), WorkerConfig::default());

        let outcome = worker.process(&delivery(&order_envelope("A1"))).await;

        let DeliveryOutcome::Deferred(retry_id) = outcome else {
            panic!("expected deferral, got {outcome:?}");
        };
        let record = retries.get(retry_id).await.unwrap().unwrap();
        assert_eq!(record.attempts, 1);
        assert_eq!(record.last_error, "transient projection failure: read store down");
        assert_eq!(source.acked().len(), 1);
    }

    #[tokio::test]
    async fn unrecordable_failure_is_left_unacked() {
        struct BrokenLedger;

        #[async_trait]
        impl RetryStore for BrokenLedger {
            async fn record_failure(
                &self,
                _: &EventEnvelope,
                _: &str,
                _: &BackoffPolicy,
                _: chrono::DateTime<Utc>,
            ) -> Result<crate::retry::RetryRecord, RetryStoreError> {
                Err(RetryStoreError::Storage("down".to_string()))
            }
            async fn claim_due(&self, _: &str, _: chrono::DateTime<Utc>, _: usize, _: Duration) -> Result<Vec<crate::retry::RetryRecord>, RetryStoreError> {
                unreachable!()
            }
            async fn renew_claim(&self, _: RetryId, _: &str, _: chrono::DateTime<Utc>, _: Duration) -> Result<bool, RetryStoreError> {
                unreachable!()
            }
            async fn complete(&self, _: RetryId, _: &str) -> Result<bool, RetryStoreError> {
                unreachable!()
            }
            async fn reschedule(&self, _: RetryId, _: &str, _: u32, _: chrono::DateTime<Utc>, _: &str, _: chrono::DateTime<Utc>) -> Result<bool, RetryStoreError> {
                unreachable!()
            }
            async fn dead_letter(&self, _: RetryId, _: &str, _: u32, _: &str, _: chrono::DateTime<Utc>) -> Result<bool, RetryStoreError> {
                unreachable!()
            }
            async fn get(&self, _: RetryId) -> Result<Option<crate::retry::RetryRecord>, RetryStoreError> {
                unreachable!()
            }
            async fn list_pending(&self, _: usize) -> Result<Vec<crate::retry::RetryRecord>, RetryStoreError> {
                unreachable!()
            }
            async fn list_dead_letters(&self, _: usize) -> Result<Vec<crate::retry::RetryRecord>, RetryStoreError> {
                unreachable!()
            }
            async fn stats(&self) -> Result<crate::retry::RetryStats, RetryStoreError> {
                unreachable!()
            }
            async fn requeue_dead_letter(&self, _: RetryId, _: chrono::DateTime<Utc>) -> Result<crate::retry::RetryRecord, RetryStoreError> {
                unreachable!()
            }
            async fn delete(&self, _: RetryId) -> Result<bool, RetryStoreError> {
                unreachable!()
            }
        }

        let source = Arc::new(RecordingSource::default());
        let worker = ProjectionWorker::new(source.clone(), Unavailable, BrokenLedger, policy(), WorkerConfig::default());

        let outcome = worker.process(&delivery(&order_envelope("A1"))).await;

        assert_eq!(outcome, DeliveryOutcome::Unacked);
        assert!(source.acked().is_empty());
        assert_eq!(source.released(), vec!["1-0".to_string()]);
    }

    #[tokio::test]
    async fn undecodable_message_without_sink_is_not_acked() {
        let source = Arc::new(RecordingSource::default());
        let retries = InMemoryRetryStore::arc();
        let worker = ProjectionWorker::new(source.clone(), Unavailable, retries.clone(), policy(), WorkerConfig::default());

        let garbage = Delivery {
            receipt: "s:0/1-0".to_string(),
            event_type: None,
            body: b"garbage".to_vec(),
        };
        let outcome = worker.process(&garbage).await;

        assert_eq!(outcome, DeliveryOutcome::Unacked);
        assert!(source.acked().is_empty());
        assert_eq!(source.released(), vec!["s:0/1-0".to_string()]);
        let stats = retries.stats().await.unwrap();
        assert_eq!((stats.pending, stats.dead_lettered), (0, 0));
    }

    #[tokio::test]
    async fn released_delivery_is_redelivered_once_the_ledger_recovers() {
        /// Rejects the first `failures` writes, then delegates to an in-memory ledger.
        struct Flaky {
            failures: std::sync::atomic::AtomicU32,
            inner: InMemoryRetryStore,
        }

        #[async_trait]
        impl RetryStore for Flaky {
            async fn record_failure(
                &self,
                envelope: &EventEnvelope,
                error: &str,
                policy: &BackoffPolicy,
                now: chrono::DateTime<Utc>,
            ) -> Result<crate::retry::RetryRecord, RetryStoreError> {
                use std::sync::atomic::Ordering;
                if self.failures.load(Ordering::SeqCst) > 0 {
                    self.failures.fetch_sub(1, Ordering::SeqCst);
                    return Err(RetryStoreError::Storage("down".to_string()));
                }
                self.inner.record_failure(envelope, error, policy, now).await
            }
            async fn claim_due(&self, o: &str, n: chrono::DateTime<Utc>, l: usize, d: Duration) -> Result<Vec<crate::retry::RetryRecord>, RetryStoreError> {
                self.inner.claim_due(o, n, l, d).await
            }
            async fn renew_claim(&self, i: RetryId, o: &str, n: chrono::DateTime<Utc>, d: Duration) -> Result<bool, RetryStoreError> {
                self.inner.renew_claim(i, o, n, d).await
            }
            async fn complete(&self, i: RetryId, o: &str) -> Result<bool, RetryStoreError> {
                self.inner.complete(i, o).await
            }
            async fn reschedule(&self, i: RetryId, o: &str, a: u32, n: chrono::DateTime<Utc>, e: &str, t: chrono::DateTime<Utc>) -> Result<bool, RetryStoreError> {
                self.inner.reschedule(i, o, a, n, e, t).await
            }
            async fn dead_letter(&self, i: RetryId, o: &str, a: u32, e: &str, t: chrono::DateTime<Utc>) -> Result<bool, RetryStoreError> {
                self.inner.dead_letter(i, o, a, e, t).await
            }
            async fn get(&self, i: RetryId) -> Result<Option<crate::retry::RetryRecord>, RetryStoreError> {
                self.inner.get(i).await
            }
            async fn list_pending(&self, l: usize) -> Result<Vec<crate::retry::RetryRecord>, RetryStoreError> {
                self.inner.list_pending(l).await
            }
            async fn list_dead_letters(&self, l: usize) -> Result<Vec<crate::retry::RetryRecord>, RetryStoreError> {
                self.inner.list_dead_letters(l).await
            }
            async fn stats(&self) -> Result<crate::retry::RetryStats, RetryStoreError> {
                self.inner.stats().await
            }
            async fn requeue_dead_letter(&self, i: RetryId, n: chrono::DateTime<Utc>) -> Result<crate::retry::RetryRecord, RetryStoreError> {
                self.inner.requeue_dead_letter(i, n).await
            }
            async fn delete(&self, i: RetryId) -> Result<bool, RetryStoreError> {
                self.inner.delete(i).await
            }
        }

        let bus = InMemoryEventBus::new();
        let source = Arc::new(SubscriptionSource::new(bus.subscribe()));
        let retries = Arc::new(Flaky {
            failures: std::sync::atomic::AtomicU32::new(1),
            inner: InMemoryRetryStore::new(),
        });
        let worker = ProjectionWorker::new(source.clone(), Unavailable, retries.clone(), policy(), WorkerConfig::default());
        bus.publish(&order_envelope("A1")).await.unwrap();

        let first = source.next_batch(8, Duration::from_millis(50)).await.unwrap();
        assert_eq!(worker.process(&first[0]).await, DeliveryOutcome::Unacked);

        let again = source.next_batch(8, Duration::from_millis(50)).await.unwrap();
        assert_eq!(again, first);
        assert!(matches!(worker.process(&again[0]).await, DeliveryOutcome::Deferred(_)));
        assert_eq!(retries.stats().await.unwrap().pending, 1);
    }

    #[tokio::test]
    async fn undecodable_message_is_dead_lettered_and_acked() {
        let source = Arc::new(RecordingSource::default());
        let sink = Arc::new(InMemoryDeadLetterSink::new());
        let worker = ProjectionWorker::new(source.clone(), Unavailable, InMemoryRetryStore::new(), policy(), WorkerConfig::default())
            .with_dead_letter_sink(sink.clone());

        let garbage = Delivery {
            receipt: "7-0".to_string(),
            event_type: Some("orders.order.created".to_string()),
            body: b"not json".to_vec(),
        };
        let outcome = worker.process(&garbage).await;

        assert_eq!(outcome, DeliveryOutcome::Poisoned);
        assert_eq!(source.acked(), vec!["7-0".to_string()]);
        let notices = sink.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].body, b"not json".to_vec());
        assert!(notices[0].aggregate_id.is_none());
    }

    #[tokio::test]
    async fn spawned_worker_projects_published_events() {
        let bus = InMemoryEventBus::new();
        let source = SubscriptionSource::new(bus.subscribe());
        let views = Arc::new(InMemoryOrderViewStore::new());
        let projection = OrderStatusProjection::new(views.clone(), order_registry().unwrap());
        let config = WorkerConfig::default().with_poll_wait(Duration::from_millis(10));

        let handle = ProjectionWorker::new(source, projection, InMemoryRetryStore::new(), policy(), config).spawn();
        bus.publish(&order_envelope("A1")).await.unwrap();

        let id = OrderId::new(AggregateId::new("A1").unwrap());
        let mut projected = None;
        for _ in 0..100 {
            projected = views.find_by_id(&id).await.unwrap();
            if projected.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await;
        assert_eq!(projected.map(|v| v.status), Some(OrderStatus::Created));
    }
}
