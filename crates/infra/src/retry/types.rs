//! Retry records and backoff policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use chronicle_core::AggregateId;
use chronicle_events::{EnvelopeError, EventEnvelope};

/// Unique retry record identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RetryId(pub Uuid);

impl RetryId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for RetryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RetryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RetryId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Retry record status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStatus {
    /// Waiting for `next_retry_at`
    Pending,
    /// Attempts exhausted; retained for operators, never due again
    DeadLettered,
}

impl RetryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStatus::Pending => "pending",
            RetryStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RetryStatus::Pending),
            "dead_lettered" => Some(RetryStatus::DeadLettered),
            _ => None,
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// base * attempt²
    #[default]
    Quadratic,
    /// base * attempt
    Linear,
    /// base * 2^(attempt-1)
    Exponential,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quadratic" => Ok(BackoffStrategy::Quadratic),
            "linear" => Ok(BackoffStrategy::Linear),
            "exponential" => Ok(BackoffStrategy::Exponential),
            other => Err(format!("unknown backoff strategy '{other}'")),
        }
    }
}

/// Backoff policy for failed projections.
///
/// With a non-zero `base_interval` every strategy is strictly increasing in the
/// attempt number until it saturates at `Duration::MAX`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_interval: Duration,
    /// Total attempts including the first failure. `1` dead-letters immediately.
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(10),
            max_attempts: 5,
            strategy: BackoffStrategy::Quadratic,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_interval: Duration, max_attempts: u32) -> Self {
        Self {
            base_interval,
            max_attempts,
            strategy: BackoffStrategy::Quadratic,
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Delay before the retry that follows failure number `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let factor: u32 = match self.strategy {
            BackoffStrategy::Quadratic => attempt.saturating_mul(attempt),
            BackoffStrategy::Linear => attempt,
            BackoffStrategy::Exponential => 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX),
        };

        self.base_interval.saturating_mul(factor)
    }

    /// Absolute instant for the next attempt after failure number `attempt`.
    pub fn next_retry_at(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay_for_attempt(attempt))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether failure number `attempts` still leaves room for another try.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// A failed projection awaiting retry, or retained after exhausting its attempts.
///
/// One record per `(aggregate_id, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRecord {
    pub id: RetryId,
    pub aggregate_id: AggregateId,
    pub version: u64,
    pub event_type: String,
    /// Encoded `EventEnvelope`.
    pub event_payload: Vec<u8>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: String,
    pub next_retry_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RetryStatus,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
}

/// What a sweep does with a record whose retry failed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepDecision {
    Reschedule { attempts: u32, next_retry_at: DateTime<Utc> },
    DeadLetter { attempts: u32 },
}

impl RetryRecord {
    /// Record for the first failed projection of `envelope`.
    pub fn first_failure(
        envelope: &EventEnvelope,
        error: impl Into<String>,
        policy: &BackoffPolicy,
        now: DateTime<Utc>,
    ) -> Result<Self, EnvelopeError> {
        let status = if policy.should_retry(1) {
            RetryStatus::Pending
        } else {
            RetryStatus::DeadLettered
        };

        Ok(Self {
            id: RetryId::new(),
            aggregate_id: envelope.aggregate_id().clone(),
            version: envelope.version(),
            event_type: envelope.event_type().to_string(),
            event_payload: envelope.encode()?,
            attempts: 1,
            max_attempts: policy.max_attempts.max(1),
            last_error: error.into(),
            next_retry_at: policy.next_retry_at(1, now),
            created_at: now,
            updated_at: now,
            status,
            claimed_by: None,
            claim_expires_at: None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        self.status == RetryStatus::DeadLettered
    }

    /// Pending, past `next_retry_at`, and not held by a live claim.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RetryStatus::Pending
            && self.next_retry_at <= now
            && self.claim_expires_at.is_none_or(|expires| expires <= now)
    }

    pub fn is_claimed_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.claimed_by.as_deref() == Some(owner)
            && self.claim_expires_at.is_some_and(|expires| expires > now)
    }

    pub fn envelope(&self) -> Result<EventEnvelope, EnvelopeError> {
        EventEnvelope::decode(&self.event_payload)
    }

    /// Decide the follow-up after another failed attempt.
    pub fn after_failed_sweep(&self, policy: &BackoffPolicy, now: DateTime<Utc>) -> SweepDecision {
        let attempts = self.attempts.saturating_add(1);
        if attempts < self.max_attempts {
            SweepDecision::Reschedule {
                attempts,
                next_retry_at: policy.next_retry_at(attempts, now),
            }
        } else {
            SweepDecision::DeadLetter { attempts }
        }
    }
}

/// Counts for operator dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryStats {
    pub pending: u64,
    pub dead_lettered: u64,
    /// Pending records currently held by a live claim.
    pub claimed: u64,
}
