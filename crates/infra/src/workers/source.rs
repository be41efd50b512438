//! Where the projection worker pulls committed envelopes from.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use chronicle_events::Subscription;

/// One message handed to a consumer.
///
/// `body` is the encoded `EventEnvelope` exactly as it crossed the broker, so
/// an undecodable message can still be dead-lettered verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-specific handle used to acknowledge (e.g. a stream entry id).
    pub receipt: String,
    /// Routing header, if the broker carried one.
    pub event_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("event source transport error: {0}")]
    Transport(String),

    #[error("event source closed")]
    Closed,
}

/// At-least-once message source.
///
/// A delivery that is never acked is delivered again (to this consumer after a
/// restart, or to another one).
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Wait up to `max_wait` for at least one message; return at most `max`.
    async fn next_batch(&self, max: usize, max_wait: Duration) -> Result<Vec<Delivery>, SourceError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), SourceError>;

    /// Give a delivery back without acking it; a later `next_batch` hands it
    /// out again.
    async fn release(&self, delivery: &Delivery) -> Result<(), SourceError>;
}

#[async_trait]
impl<S> EventSource for Arc<S>
where
    S: EventSource + ?Sized,
{
    async fn next_batch(&self, max: usize, max_wait: Duration) -> Result<Vec<Delivery>, SourceError> {
        (**self).next_batch(max, max_wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), SourceError> {
        (**self).ack(delivery).await
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), SourceError> {
        (**self).release(delivery).await
    }
}

/// Adapts an in-process bus subscription (tests/dev). Acks are no-ops;
/// released deliveries are handed out again before anything new.
#[derive(Debug)]
pub struct SubscriptionSource {
    subscription: Mutex<Subscription>,
    released: Mutex<VecDeque<Delivery>>,
}

impl SubscriptionSource {
    pub fn new(subscription: Subscription) -> Self {
        Self {
            subscription: Mutex::new(subscription),
            released: Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl EventSource for SubscriptionSource {
    async fn next_batch(&self, max: usize, max_wait: Duration) -> Result<Vec<Delivery>, SourceError> {
        {
            let mut released = self.released.lock().await;
            if !released.is_empty() {
                let take = max.max(1).min(released.len());
                return Ok(released.drain(..take).collect());
            }
        }

        let mut subscription = self.subscription.lock().await;

        let Some(first) = subscription.recv_timeout(max_wait).await else {
            return Ok(vec![]);
        };

        let mut envelopes = vec![first];
        while envelopes.len() < max {
            match subscription.try_recv() {
                Ok(envelope) => envelopes.push(envelope),
                Err(_) => break,
            }
        }

        envelopes
            .into_iter()
            .map(|envelope| {
                let body = envelope
                    .encode()
                    .map_err(|e| SourceError::Transport(e.to_string()))?;
                Ok(Delivery {
                    receipt: format!("{}:{}", envelope.aggregate_id(), envelope.version()),
                    event_type: Some(envelope.event_type().to_string()),
                    body,
                })
            })
            .collect()
    }

    async fn ack(&self, _delivery: &Delivery) -> Result<(), SourceError> {
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<(), SourceError> {
        self.released.lock().await.push_back(delivery.clone());
        Ok(())
    }
}
