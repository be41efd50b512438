//! Retry ledger storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use chronicle_core::AggregateId;
use chronicle_events::EventEnvelope;

use super::types::{BackoffPolicy, RetryId, RetryRecord, RetryStats, RetryStatus};

/// Durable record of failed projections.
///
/// Every mutation made on behalf of a sweeper is fenced by `owner`: it only
/// applies while the record is still claimed by that owner, and returns `false`
/// otherwise (the claim was lost to another sweeper after the lease expired).
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Create the record for a first failure.
    ///
    /// Idempotent per `(aggregate_id, version)`: if the event already has a
    /// record, it is returned unchanged.
    async fn record_failure(
        &self,
        envelope: &EventEnvelope,
        error: &str,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, RetryStoreError>;

    /// Atomically claim up to `limit` due records for `owner` until `now + lease`.
    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<RetryRecord>, RetryStoreError>;

    /// Extend a live claim held by `owner` to `now + lease`.
    ///
    /// Returns `false` if the claim already lapsed or belongs to someone else;
    /// the caller must then leave the record alone.
    async fn renew_claim(
        &self,
        id: RetryId,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, RetryStoreError>;

    /// Delete a record after a successful retry.
    async fn complete(&self, id: RetryId, owner: &str) -> Result<bool, RetryStoreError>;

    /// Record another failure and release the claim.
    async fn reschedule(
        &self,
        id: RetryId,
        owner: &str,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RetryStoreError>;

    /// Mark a record terminal. It is retained but never due again.
    async fn dead_letter(
        &self,
        id: RetryId,
        owner: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RetryStoreError>;

    async fn get(&self, id: RetryId) -> Result<Option<RetryRecord>, RetryStoreError>;

    /// Pending records, soonest `next_retry_at` first.
    async fn list_pending(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError>;

    /// Dead-lettered records, most recently failed first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError>;

    async fn stats(&self) -> Result<RetryStats, RetryStoreError>;

    /// Operator action: put a dead-lettered record back in the queue with a
    /// fresh attempt budget, due at `now`.
    async fn requeue_dead_letter(&self, id: RetryId, now: DateTime<Utc>) -> Result<RetryRecord, RetryStoreError>;

    /// Operator action: drop a record regardless of its status.
    async fn delete(&self, id: RetryId) -> Result<bool, RetryStoreError>;
}

/// Retry store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RetryStoreError {
    #[error("retry record not found: {0}")]
    NotFound(RetryId),
    #[error("retry record {id} is {status:?}")]
    InvalidState { id: RetryId, status: RetryStatus },
    #[error("storage error: {0}")]
    Storage(String),
    #[error("failed to encode envelope: {0}")]
    Encode(String),
}

#[async_trait]
impl<R> RetryStore for Arc<R>
where
    R: RetryStore + ?Sized,
{
    async fn record_failure(
        &self,
        envelope: &EventEnvelope,
        error: &str,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, RetryStoreError> {
        (**self).record_failure(envelope, error, policy, now).await
    }

    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<RetryRecord>, RetryStoreError> {
        (**self).claim_due(owner, now, limit, lease).await
    }

    async fn renew_claim(
        &self,
        id: RetryId,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, RetryStoreError> {
        (**self).renew_claim(id, owner, now, lease).await
    }

    async fn complete(&self, id: RetryId, owner: &str) -> Result<bool, RetryStoreError> {
        (**self).complete(id, owner).await
    }

    async fn reschedule(
        &self,
        id: RetryId,
        owner: &str,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RetryStoreError> {
        (**self).reschedule(id, owner, attempts, next_retry_at, error, now).await
    }

    async fn dead_letter(
        &self,
        id: RetryId,
        owner: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RetryStoreError> {
        (**self).dead_letter(id, owner, attempts, error, now).await
    }

    async fn get(&self, id: RetryId) -> Result<Option<RetryRecord>, RetryStoreError> {
        (**self).get(id).await
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        (**self).list_pending(limit).await
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        (**self).list_dead_letters(limit).await
    }

    async fn stats(&self) -> Result<RetryStats, RetryStoreError> {
        (**self).stats().await
    }

    async fn requeue_dead_letter(&self, id: RetryId, now: DateTime<Utc>) -> Result<RetryRecord, RetryStoreError> {
        (**self).requeue_dead_letter(id, now).await
    }

    async fn delete(&self, id: RetryId) -> Result<bool, RetryStoreError> {
        (**self).delete(id).await
    }
}

/// `now + lease`, clamped instead of overflowing.
pub(crate) fn lease_expiry(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Default)]
struct Ledger {
    records: HashMap<RetryId, RetryRecord>,
    by_event: HashMap<(AggregateId, u64), RetryId>,
}

impl Ledger {
    fn claimed_mut(&mut self, id: RetryId, owner: &str) -> Option<&mut RetryRecord> {
        self.records
            .get_mut(&id)
            .filter(|r| r.status == RetryStatus::Pending && r.claimed_by.as_deref() == Some(owner))
    }

    fn remove(&mut self, id: RetryId) -> Option<RetryRecord> {
        let record = self.records.remove(&id)?;
        self.by_event.remove(&(record.aggregate_id.clone(), record.version));
        Some(record)
    }
}

/// In-memory retry store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryRetryStore {
    ledger: RwLock<Ledger>,
}

impl InMemoryRetryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Ledger>, RetryStoreError> {
        self.ledger
            .read()
            .map_err(|_| RetryStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Ledger>, RetryStoreError> {
        self.ledger
            .write()
            .map_err(|_| RetryStoreError::Storage("lock poisoned".to_string()))
    }
}

#[async_trait]
impl RetryStore for InMemoryRetryStore {
    async fn record_failure(
        &self,
        envelope: &EventEnvelope,
        error: &str,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<RetryRecord, RetryStoreError> {
        let mut ledger = self.write()?;
        let key = (envelope.aggregate_id().clone(), envelope.version());
        if let Some(existing) = ledger.by_event.get(&key).and_then(|id| ledger.records.get(id)) {
            return Ok(existing.clone());
        }

        let record = RetryRecord::first_failure(envelope, error, policy, now)
            .map_err(|e| RetryStoreError::Encode(e.to_string()))?;
        ledger.by_event.insert(key, record.id);
        ledger.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn claim_due(
        &self,
        owner: &str,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<RetryRecord>, RetryStoreError> {
        let mut ledger = self.write()?;

        let mut due: Vec<(DateTime<Utc>, RetryId)> = ledger
            .records
            .values()
            .filter(|r| r.is_due(now))
            .map(|r| (r.next_retry_at, r.id))
            .collect();
        due.sort();
        due.truncate(limit);

        let expires = lease_expiry(now, lease);
        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(record) = ledger.records.get_mut(&id) {
                record.claimed_by = Some(owner.to_string());
                record.claim_expires_at = Some(expires);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn renew_claim(
        &self,
        id: RetryId,
        owner: &str,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<bool, RetryStoreError> {
        let mut ledger = self.write()?;
        match ledger.claimed_mut(id, owner) {
            Some(record) if record.is_claimed_by(owner, now) => {
                record.claim_expires_at = Some(lease_expiry(now, lease));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete(&self, id: RetryId, owner: &str) -> Result<bool, RetryStoreError> {
        let mut ledger = self.write()?;
        if ledger.claimed_mut(id, owner).is_none() {
            return Ok(false);
        }
        Ok(ledger.remove(id).is_some())
    }

    async fn reschedule(
        &self,
        id: RetryId,
        owner: &str,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RetryStoreError> {
        let mut ledger = self.write()?;
        let Some(record) = ledger.claimed_mut(id, owner) else {
            return Ok(false);
        };

        record.attempts = attempts;
        record.next_retry_at = next_retry_at;
        record.last_error = error.to_string();
        record.updated_at = now;
        record.claimed_by = None;
        record.claim_expires_at = None;
        Ok(true)
    }

    async fn dead_letter(
        &self,
        id: RetryId,
        owner: &str,
        attempts: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, RetryStoreError> {
        let mut ledger = self.write()?;
        let Some(record) = ledger.claimed_mut(id, owner) else {
            return Ok(false);
        };

        record.attempts = attempts;
        record.last_error = error.to_string();
        record.status = RetryStatus::DeadLettered;
        record.updated_at = now;
        record.claimed_by = None;
        record.claim_expires_at = None;
        Ok(true)
    }

    async fn get(&self, id: RetryId) -> Result<Option<RetryRecord>, RetryStoreError> {
        Ok(self.read()?.records.get(&id).cloned())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        let ledger = self.read()?;
        let mut result: Vec<_> = ledger
            .records
            .values()
            .filter(|r| r.status == RetryStatus::Pending)
            .cloned()
            .collect();

        result.sort_by_key(|r| (r.next_retry_at, r.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<RetryRecord>, RetryStoreError> {
        let ledger = self.read()?;
        let mut result: Vec<_> = ledger.records.values().filter(|r| r.is_terminal()).cloned().collect();

        result.sort_by_key(|r| std::cmp::Reverse((r.updated_at, r.id)));
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<RetryStats, RetryStoreError> {
        let now = Utc::now();
        let ledger = self.read()?;
        let mut stats = RetryStats::default();

        for record in ledger.records.values() {
            match record.status {
                RetryStatus::Pending => {
                    stats.pending += 1;
                    if record.claim_expires_at.is_some_and(|expires| expires > now) {
                        stats.claimed += 1;
                    }
                }
                RetryStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }

    async fn requeue_dead_letter(&self, id: RetryId, now: DateTime<Utc>) -> Result<RetryRecord, RetryStoreError> {
        let mut ledger = self.write()?;
        let record = ledger.records.get_mut(&id).ok_or(RetryStoreError::NotFound(id))?;
        if !record.is_terminal() {
            return Err(RetryStoreError::InvalidState {
                id,
                status: record.status,
            });
        }

        record.status = RetryStatus::Pending;
        record.attempts = 1;
        record.next_retry_at = now;
        record.updated_at = now;
        record.claimed_by = None;
        record.claim_expires_at = None;
        Ok(record.clone())
    }

    async fn delete(&self, id: RetryId) -> Result<bool, RetryStoreError> {
        Ok(self.write()?.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    const LEASE: Duration = Duration::from_secs(30);

    fn envelope(aggregate: &str, version: u64) -> EventEnvelope {
        EventEnvelope::new(
            "orders.order.created",
            AggregateId::new(aggregate).unwrap(),
            version,
            Utc::now(),
            br#"{}"#.to_vec(),
        )
    }

    fn policy(max_attempts: u32) -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(10), max_attempts)
    }

    #[tokio::test]
    async fn record_failure_is_idempotent_per_event() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();

        let first = store.record_failure(&envelope("A1", 1), "boom", &policy(3), now).await.unwrap();
        let again = store
            .record_failure(&envelope("A1", 1), "boom again", &policy(3), now)
            .await
            .unwrap();
        let other = store.record_failure(&envelope("A1", 2), "boom", &policy(3), now).await.unwrap();

        assert_eq!(first.id, again.id);
        assert_eq!(again.last_error, "boom");
        assert_ne!(first.id, other.id);
        assert_eq!(store.stats().await.unwrap().pending, 2);
    }

    #[tokio::test]
    async fn only_records_past_next_retry_at_are_claimed() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let record = store.record_failure(&envelope("A1", 1), "boom", &policy(3), now).await.unwrap();

        let early = store.claim_due("s1", now + ChronoDuration::seconds(9), 10, LEASE).await.unwrap();
        assert!(early.is_empty());

        let due = store.claim_due("s1", now + ChronoDuration::seconds(10), 10, LEASE).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, record.id);
        assert_eq!(due[0].claimed_by.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn claimed_records_are_invisible_to_other_sweepers_until_lease_expires() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let record = store.record_failure(&envelope("A1", 1), "boom", &policy(3), now).await.unwrap();
        let t = now + ChronoDuration::seconds(10);

        assert_eq!(store.claim_due("s1", t, 10, LEASE).await.unwrap().len(), 1);
        assert!(store.claim_due("s2", t, 10, LEASE).await.unwrap().is_empty());
        assert_eq!(store.stats().await.unwrap().claimed, 1);

        let after_lease = t + ChronoDuration::seconds(30);
        let stolen = store.claim_due("s2", after_lease, 10, LEASE).await.unwrap();
        assert_eq!(stolen[0].id, record.id);

        // s1 lost the claim: its writes are fenced off.
        assert!(!store.complete(record.id, "s1").await.unwrap());
        assert!(store.complete(record.id, "s2").await.unwrap());
        assert!(store.get(record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn non_json_payload_is_recorded_and_recovered_intact() {
        let store = InMemoryRetryStore::new();
        let opaque = EventEnvelope::new("orders.order.created", AggregateId::new("A1").unwrap(), 1, Utc::now(), vec![0xde, 0xad, 0xbe, 0xef]);

        let record = store.record_failure(&opaque, "boom", &policy(3), Utc::now()).await.unwrap();

        assert_eq!(record.envelope().unwrap(), opaque);
    }

    #[tokio::test]
    async fn renewal_extends_only_a_live_claim_of_the_same_owner() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let record = store.record_failure(&envelope("A1", 1), "boom", &policy(3), now).await.unwrap();
        let t = now + ChronoDuration::seconds(10);
        store.claim_due("s1", t, 10, LEASE).await.unwrap();

        assert!(!store.renew_claim(record.id, "s2", t, LEASE).await.unwrap());
        assert!(store.renew_claim(record.id, "s1", t + ChronoDuration::seconds(20), LEASE).await.unwrap());
        // Renewed at t+20, so still held at t+45.
        assert!(store.claim_due("s2", t + ChronoDuration::seconds(45), 10, LEASE).await.unwrap().is_empty());

        // Lapsed claims cannot be revived.
        let lapsed = t + ChronoDuration::seconds(51);
        assert!(!store.renew_claim(record.id, "s1", lapsed, LEASE).await.unwrap());
        assert_eq!(store.claim_due("s2", lapsed, 10, LEASE).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_respects_limit_and_due_order() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let late = store.record_failure(&envelope("A1", 1), "x", &policy(3), now).await.unwrap();
        let early = store
            .record_failure(&envelope("B2", 1), "x", &policy(3), now - ChronoDuration::seconds(5))
            .await
            .unwrap();

        let claimed = store.claim_due("s1", now + ChronoDuration::hours(1), 1, LEASE).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, early.id);
        assert_ne!(claimed[0].id, late.id);
    }

    #[tokio::test]
    async fn reschedule_releases_claim_and_updates_schedule() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let record = store.record_failure(&envelope("A1", 1), "boom", &policy(3), now).await.unwrap();
        let t = now + ChronoDuration::seconds(10);
        store.claim_due("s1", t, 10, LEASE).await.unwrap();

        let next = t + ChronoDuration::seconds(40);
        assert!(store.reschedule(record.id, "s1", 2, next, "still down", t).await.unwrap());

        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.attempts, 2);
        assert_eq!(stored.next_retry_at, next);
        assert_eq!(stored.last_error, "still down");
        assert!(stored.claimed_by.is_none());
        assert!(store.claim_due("s2", t, 10, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn dead_lettered_records_are_never_due_again() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let record = store.record_failure(&envelope("A1", 1), "boom", &policy(2), now).await.unwrap();
        let t = now + ChronoDuration::seconds(10);
        store.claim_due("s1", t, 10, LEASE).await.unwrap();

        assert!(store.dead_letter(record.id, "s1", 2, "gave up", t).await.unwrap());
        assert!(store.claim_due("s1", DateTime::<Utc>::MAX_UTC, 10, LEASE).await.unwrap().is_empty());

        let dead = store.list_dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        assert!(store.list_pending(10).await.unwrap().is_empty());

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.pending, stats.dead_lettered), (0, 1));
    }

    #[tokio::test]
    async fn requeue_resets_a_dead_letter_only() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let dead = store.record_failure(&envelope("A1", 1), "boom", &policy(1), now).await.unwrap();
        let pending = store.record_failure(&envelope("B2", 1), "boom", &policy(3), now).await.unwrap();
        assert!(dead.is_terminal());

        let requeued = store.requeue_dead_letter(dead.id, now).await.unwrap();
        assert_eq!(requeued.status, RetryStatus::Pending);
        assert_eq!(requeued.attempts, 1);
        assert_eq!(store.claim_due("s1", now, 10, LEASE).await.unwrap()[0].id, dead.id);

        assert!(matches!(
            store.requeue_dead_letter(pending.id, now).await,
            Err(RetryStoreError::InvalidState { .. })
        ));
        assert!(matches!(
            store.requeue_dead_letter(RetryId::new(), now).await,
            Err(RetryStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_frees_the_event_slot() {
        let store = InMemoryRetryStore::new();
        let now = Utc::now();
        let record = store.record_failure(&envelope("A1", 1), "boom", &policy(3), now).await.unwrap();

        assert!(store.delete(record.id).await.unwrap());
        assert!(!store.delete(record.id).await.unwrap());

        let fresh = store.record_failure(&envelope("A1", 1), "again", &policy(3), now).await.unwrap();
        assert_ne!(fresh.id, record.id);
    }
}
