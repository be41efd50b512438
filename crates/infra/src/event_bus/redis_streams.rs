//! Redis Streams transport (durable, at-least-once, partitioned).
//!
//! ## Layout
//!
//! - **Partition streams**: `{topic}:{p}` for `p in 0..partitions`. An envelope
//!   goes to `partition_for(aggregate_id)`, so one aggregate always lands on the
//!   same stream and is read back in append order.
//! - **Entry fields**: `key` (aggregate id), `event_type`, `envelope` (encoded
//!   `EventEnvelope`).
//! - **Consumer group**: one per projection, spanning every partition stream.
//!   Entries stay pending until `XACK`; a crashed consumer's entries are
//!   re-delivered on restart or taken over via `reclaim_stale`.
//! - **Dead letters**: `{topic}:dlq`, one entry per notice.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, instrument, warn};

use chronicle_events::{EventEnvelope, EventPublisher, PublishError};

use super::partition::{partition_for, stream_key, stream_keys};
use crate::retry::{DeadLetterError, DeadLetterNotice, DeadLetterSink};
use crate::workers::{Delivery, EventSource, SourceError};

const FIELD_KEY: &str = "key";
const FIELD_EVENT_TYPE: &str = "event_type";
const FIELD_ENVELOPE: &str = "envelope";

/// Separates the stream key from the entry id inside a delivery receipt.
const RECEIPT_SEPARATOR: char = '/';

#[derive(Debug, thiserror::Error)]
pub enum RedisStreamsError {
    #[error("redis connection error: {0}")]
    Connection(String),

    #[error("redis command error: {0}")]
    Command(String),

    #[error("consumer group error: {0}")]
    ConsumerGroup(String),
}

pub fn dead_letter_key(topic: &str) -> String {
    format!("{topic}:dlq")
}

async fn connect(client: &redis::Client) -> Result<MultiplexedConnection, RedisStreamsError> {
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| RedisStreamsError::Connection(e.to_string()))
}

/// Publishes envelopes to the partition stream of their aggregate.
#[derive(Clone)]
pub struct RedisStreamsPublisher {
    conn: MultiplexedConnection,
    topic: String,
    partitions: u32,
}

impl std::fmt::Debug for RedisStreamsPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsPublisher")
            .field("topic", &self.topic)
            .field("partitions", &self.partitions)
            .finish()
    }
}

impl RedisStreamsPublisher {
    pub async fn connect(
        client: &redis::Client,
        topic: impl Into<String>,
        partitions: u32,
    ) -> Result<Self, RedisStreamsError> {
        Ok(Self {
            conn: connect(client).await?,
            topic: topic.into(),
            partitions: partitions.max(1),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

#[async_trait]
impl EventPublisher for RedisStreamsPublisher {
    #[instrument(
        skip(self, envelope),
        fields(
            topic = %self.topic,
            aggregate_id = %envelope.aggregate_id(),
            version = envelope.version(),
            event_type = %envelope.event_type(),
        ),
        err
    )]
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), PublishError> {
        let body = envelope.encode().map_err(|e| PublishError::Encode(e.to_string()))?;
        let key = envelope.aggregate_id().as_str();
        let stream = stream_key(&self.topic, partition_for(key, self.partitions));

        let mut conn = self.conn.clone();
        let entry_id: String = redis::cmd("XADD")
            .arg(&stream)
            .arg("*")
            .arg(FIELD_KEY)
            .arg(key)
            .arg(FIELD_EVENT_TYPE)
            .arg(envelope.event_type())
            .arg(FIELD_ENVELOPE)
            .arg(body)
            .query_async(&mut conn)
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        debug!(stream = %stream, entry_id = %entry_id, "envelope published");
        Ok(())
    }
}

/// A named consumer in a consumer group, reading every partition of a topic.
pub struct RedisStreamsConsumer {
    conn: MultiplexedConnection,
    streams: Vec<String>,
    group: String,
    consumer: String,
    /// Until our own pending list has been drained, read from id `0` instead of `>`.
    replaying_pending: AtomicBool,
}

impl std::fmt::Debug for RedisStreamsConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsConsumer")
            .field("streams", &self.streams)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}

impl RedisStreamsConsumer {
    /// Connect and make sure the group exists on every partition stream.
    pub async fn connect(
        client: &redis::Client,
        topic: &str,
        partitions: u32,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, RedisStreamsError> {
        let this = Self {
            conn: connect(client).await?,
            streams: stream_keys(topic, partitions),
            group: group.into(),
            consumer: consumer.into(),
            replaying_pending: AtomicBool::new(true),
        };
        this.ensure_consumer_group().await?;
        Ok(this)
    }

    /// `XGROUP CREATE .. MKSTREAM` on each stream; an existing group is fine.
    pub async fn ensure_consumer_group(&self) -> Result<(), RedisStreamsError> {
        let mut conn = self.conn.clone();
        for stream in &self.streams {
            let created: redis::RedisResult<()> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(stream)
                .arg(&self.group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(&mut conn)
                .await;

            match created {
                Ok(()) => debug!(stream = %stream, group = %self.group, "consumer group created"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(RedisStreamsError::ConsumerGroup(e.to_string())),
            }
        }
        Ok(())
    }

    /// Take over entries another consumer has held longer than `min_idle`.
    ///
    /// Claimed entries join this consumer's pending list and are handed out by
    /// the next `next_batch`.
    #[instrument(skip(self), fields(group = %self.group, consumer = %self.consumer), err)]
    pub async fn reclaim_stale(&self, min_idle: Duration, count: usize) -> Result<usize, RedisStreamsError> {
        let mut conn = self.conn.clone();
        let min_idle_ms = u64::try_from(min_idle.as_millis()).unwrap_or(u64::MAX);
        let mut reclaimed = 0;

        for stream in &self.streams {
            let pending: StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(stream)
                .arg(&self.group)
                .arg("IDLE")
                .arg(min_idle_ms)
                .arg("-")
                .arg("+")
                .arg(count)
                .query_async(&mut conn)
                .await
                .map_err(|e| RedisStreamsError::Command(e.to_string()))?;

            let ids: Vec<&str> = pending
                .ids
                .iter()
                .filter(|p| p.consumer != self.consumer)
                .map(|p| p.id.as_str())
                .collect();
            if ids.is_empty() {
                continue;
            }

            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(stream)
                .arg(&self.group)
                .arg(&self.consumer)
                .arg(min_idle_ms)
                .arg(&ids)
                .query_async(&mut conn)
                .await
                .map_err(|e| RedisStreamsError::Command(e.to_string()))?;

            reclaimed += claimed.ids.len();
        }

        if reclaimed > 0 {
            warn!(reclaimed, "reclaimed stale pending entries");
            self.replaying_pending.store(true, Ordering::SeqCst);
        }
        Ok(reclaimed)
    }

    /// Periodically run `reclaim_stale(min_idle, count)` until shut down.
    pub fn spawn_reclaimer(self: Arc<Self>, min_idle: Duration, count: usize) -> ReclaimerHandle {
        let shutdown = Arc::new(Notify::new());
        let signal = shutdown.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(min_idle);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = signal.notified() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.reclaim_stale(min_idle, count).await {
                            error!(consumer = %self.consumer, error = %e, "failed to reclaim stale entries");
                        }
                    }
                }
            }
        });

        ReclaimerHandle { shutdown, join }
    }

    async fn read(&self, start_id: &str, max: usize, max_wait: Duration) -> Result<Vec<Delivery>, SourceError> {
        let mut conn = self.conn.clone();
        let block_ms = u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX);

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(block_ms)
            .arg("STREAMS")
            .arg(&self.streams);
        for _ in &self.streams {
            cmd.arg(start_id);
        }

        let reply: Option<StreamReadReply> = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;

        let Some(reply) = reply else {
            return Ok(vec![]);
        };

        let mut deliveries = Vec::new();
        for stream in reply.keys {
            for entry in stream.ids {
                match parse_entry(&stream.key, &entry) {
                    Some(delivery) => deliveries.push(delivery),
                    None => {
                        // Trimmed/deleted entries come back with no fields; nothing to deliver.
                        self.ack_raw(&stream.key, &entry.id).await?;
                    }
                }
            }
        }
        Ok(deliveries)
    }

    async fn ack_raw(&self, stream: &str, entry_id: &str) -> Result<(), SourceError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(&self.group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| SourceError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Handle to stop a spawned reclaimer.
#[derive(Debug)]
pub struct ReclaimerHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl ReclaimerHandle {
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            warn!(error = %e, "reclaimer task ended abnormally");
        }
    }
}

#[async_trait]
impl EventSource for RedisStreamsConsumer {
    async fn next_batch(&self, max: usize, max_wait: Duration) -> Result<Vec<Delivery>, SourceError> {
        if self.replaying_pending.load(Ordering::SeqCst) {
            let pending = self.read("0", max, max_wait).await?;
            if !pending.is_empty() {
                debug!(count = pending.len(), "re-delivering pending entries");
                return Ok(pending);
            }
            self.replaying_pending.store(false, Ordering::SeqCst);
        }
        self.read(">", max, max_wait).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), SourceError> {
        let (stream, entry_id) = split_receipt(&delivery.receipt)
            .ok_or_else(|| SourceError::Transport(format!("malformed receipt: {}", delivery.receipt)))?;
        self.ack_raw(stream, entry_id).await
    }

    /// The entry is still in our pending list; re-read it from there.
    async fn release(&self, delivery: &Delivery) -> Result<(), SourceError> {
        debug!(receipt = %delivery.receipt, "entry released, replaying pending list");
        self.replaying_pending.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn receipt(stream: &str, entry_id: &str) -> String {
    format!("{stream}{RECEIPT_SEPARATOR}{entry_id}")
}

fn split_receipt(receipt: &str) -> Option<(&str, &str)> {
    receipt.rsplit_once(RECEIPT_SEPARATOR)
}

/// `None` for entries without an `envelope` field.
fn parse_entry(stream: &str, entry: &StreamId) -> Option<Delivery> {
    let body: Vec<u8> = entry.get(FIELD_ENVELOPE)?;
    Some(Delivery {
        receipt: receipt(stream, &entry.id),
        event_type: entry.get(FIELD_EVENT_TYPE),
        body,
    })
}

/// Pushes dead-letter notices to `{topic}:dlq`.
#[derive(Clone)]
pub struct RedisStreamsDeadLetterSink {
    conn: MultiplexedConnection,
    key: String,
}

impl std::fmt::Debug for RedisStreamsDeadLetterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamsDeadLetterSink").field("key", &self.key).finish()
    }
}

impl RedisStreamsDeadLetterSink {
    pub async fn connect(client: &redis::Client, topic: &str) -> Result<Self, RedisStreamsError> {
        Ok(Self {
            conn: connect(client).await?,
            key: dead_letter_key(topic),
        })
    }
}

#[async_trait]
impl DeadLetterSink for RedisStreamsDeadLetterSink {
    async fn notify(&self, notice: &DeadLetterNotice) -> Result<(), DeadLetterError> {
        let mut conn = self.conn.clone();
        let aggregate_id = notice.aggregate_id.as_ref().map(|id| id.as_str().to_string()).unwrap_or_default();
        let version = notice.version.map(|v| v.to_string()).unwrap_or_default();

        let _: String = redis::cmd("XADD")
            .arg(&self.key)
            .arg("*")
            .arg(FIELD_EVENT_TYPE)
            .arg(&notice.event_type)
            .arg(FIELD_KEY)
            .arg(aggregate_id)
            .arg("version")
            .arg(version)
            .arg("attempts")
            .arg(notice.attempts)
            .arg("error")
            .arg(&notice.error)
            .arg("failed_at")
            .arg(notice.failed_at.to_rfc3339())
            .arg("noticed_at")
            .arg(Utc::now().to_rfc3339())
            .arg("body")
            .arg(notice.body.as_slice())
            .query_async(&mut conn)
            .await
            .map_err(|e| DeadLetterError(e.to_string()))?;
        Ok(())
    }
}
