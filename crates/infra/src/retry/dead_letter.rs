//! Operator-visible dead-letter channel.
//!
//! The retry ledger is the durable record of dead letters; a sink is an
//! additional push notification so operators don't have to poll.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use chronicle_core::AggregateId;

use super::types::RetryRecord;

/// A unit of work given up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterNotice {
    pub event_type: String,
    /// `None` when the message could not even be decoded into an envelope.
    pub aggregate_id: Option<AggregateId>,
    pub version: Option<u64>,
    pub attempts: u32,
    pub error: String,
    /// The original message body (an encoded envelope, or raw bytes if undecodable).
    pub body: Vec<u8>,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterNotice {
    pub fn from_record(record: &RetryRecord, failed_at: DateTime<Utc>) -> Self {
        Self {
            event_type: record.event_type.clone(),
            aggregate_id: Some(record.aggregate_id.clone()),
            version: Some(record.version),
            attempts: record.attempts,
            error: record.last_error.clone(),
            body: record.event_payload.clone(),
            failed_at,
        }
    }

    /// A broker message that never made it to a projection.
    pub fn undecodable(
        event_type: impl Into<String>,
        body: Vec<u8>,
        error: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_id: None,
            version: None,
            attempts: 0,
            error: error.into(),
            body,
            failed_at,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("dead-letter sink error: {0}")]
pub struct DeadLetterError(pub String);

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn notify(&self, notice: &DeadLetterNotice) -> Result<(), DeadLetterError>;
}

#[async_trait]
impl<D> DeadLetterSink for Arc<D>
where
    D: DeadLetterSink + ?Sized,
{
    async fn notify(&self, notice: &DeadLetterNotice) -> Result<(), DeadLetterError> {
        (**self).notify(notice).await
    }
}

/// Collects notices in memory (tests/dev).
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterSink {
    notices: Mutex<Vec<DeadLetterNotice>>,
}

impl InMemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<DeadLetterNotice> {
        self.notices.lock().map(|n| n.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetterSink for InMemoryDeadLetterSink {
    async fn notify(&self, notice: &DeadLetterNotice) -> Result<(), DeadLetterError> {
        self.notices
            .lock()
            .map_err(|_| DeadLetterError("lock poisoned".to_string()))?
            .push(notice.clone());
        Ok(())
    }
}
