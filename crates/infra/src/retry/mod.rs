//! Projection retry subsystem with backoff, bounded attempts, and dead letters.
//!
//! ## Flow
//!
//! 1. A projection fails for an envelope: `RetryStore::record_failure` stores a
//!    record with `attempts = 1` and `next_retry_at = now + backoff(1)`.
//! 2. `RetrySweeper` claims due records and resubmits them to the projection.
//! 3. Success deletes the record. Failure either reschedules it
//!    (`attempts + 1 < max_attempts`) or dead-letters it.
//! 4. Dead-lettered records are kept for operators (`list_dead_letters`,
//!    `requeue_dead_letter`) and are never due again.

pub mod dead_letter;
pub mod postgres;
pub mod store;
pub mod sweeper;
pub mod types;

pub use dead_letter::{DeadLetterError, DeadLetterNotice, DeadLetterSink, InMemoryDeadLetterSink};
pub use postgres::PostgresRetryStore;
pub use store::{InMemoryRetryStore, RetryStore, RetryStoreError};
pub use sweeper::{RetrySweeper, SweepReport, SweeperConfig, SweeperHandle};
pub use types::{BackoffPolicy, BackoffStrategy, RetryId, RetryRecord, RetryStats, RetryStatus, SweepDecision};
