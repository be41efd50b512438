//! Retry sweeper: resubmits due retry records to a projection.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::dead_letter::{DeadLetterNotice, DeadLetterSink};
use super::store::{RetryStore, RetryStoreError};
use super::types::{BackoffPolicy, RetryRecord, SweepDecision};
use crate::projections::{ProjectionApplier, ProjectionError};

/// Sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Claim owner; must be unique per running sweeper
    pub name: String,
    /// How often to look for due records
    pub poll_interval: Duration,
    /// Maximum records claimed per pass
    pub batch_size: usize,
    /// How long a claim stays exclusive
    pub lease: Duration,
    /// Bound on a single projection call
    pub projection_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            name: "retry-sweeper".to_string(),
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            lease: Duration::from_secs(60),
            projection_timeout: Duration::from_secs(5),
        }
    }
}

impl SweeperConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_projection_timeout(mut self, timeout: Duration) -> Self {
        self.projection_timeout = timeout;
        self
    }
}

/// Outcome of one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
    /// Records whose claim expired and was taken over before we finished.
    pub lost_claims: usize,
}

/// Handle to stop a spawned sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Arc<Notify>,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// Request graceful shutdown and wait for the current pass to finish.
    pub async fn shutdown(self) {
        self.shutdown.notify_one();
        if let Err(e) = self.join.await {
            warn!(error = %e, "retry sweeper task ended abnormally");
        }
    }
}

/// Polls the retry ledger and resubmits due records to the projection.
///
/// Several sweepers may run against the same store; claims keep them from
/// processing the same record concurrently.
pub struct RetrySweeper<R, A> {
    store: R,
    applier: A,
    policy: BackoffPolicy,
    config: SweeperConfig,
    dead_letters: Option<Arc<dyn DeadLetterSink>>,
}

impl<R, A> RetrySweeper<R, A>
where
    R: RetryStore,
    A: ProjectionApplier,
{
    pub fn new(store: R, applier: A, policy: BackoffPolicy, config: SweeperConfig) -> Self {
        Self {
            store,
            applier,
            policy,
            config,
            dead_letters: None,
        }
    }

    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = Some(sink);
        self
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// Claim every record due at `now` (up to the batch size) and retry it once.
    ///
    /// Each claim is renewed right before its retry; a record whose claim has
    /// already passed to another sweeper is skipped untouched.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, RetryStoreError> {
        let owner = self.config.name.as_str();
        let records = self
            .store
            .claim_due(owner, now, self.config.batch_size, self.config.lease)
            .await?;

        let mut report = SweepReport {
            claimed: records.len(),
            ..SweepReport::default()
        };

        let started = tokio::time::Instant::now();
        for record in records {
            // Earlier records may have eaten into this one's lease.
            let elapsed = chrono::Duration::from_std(started.elapsed()).unwrap_or(chrono::Duration::zero());
            let at = now.checked_add_signed(elapsed).unwrap_or(now);
            match self.store.renew_claim(record.id, owner, at, self.config.lease).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(sweeper = %owner, retry_id = %record.id, "claim lapsed before retry, skipping");
                    report.lost_claims += 1;
                    continue;
                }
                Err(e) => {
                    warn!(sweeper = %owner, retry_id = %record.id, error = %e, "failed to renew claim");
                    continue;
                }
            }

            if let Err(e) = self.retry_one(&record, now, &mut report).await {
                // The claim stays in place until the lease runs out; the record is
                // picked up again by a later pass.
                warn!(
                    sweeper = %owner,
                    retry_id = %record.id,
                    error = %e,
                    "failed to update retry record"
                );
            }
        }

        Ok(report)
    }

    async fn retry_one(
        &self,
        record: &RetryRecord,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), RetryStoreError> {
        let owner = self.config.name.as_str();

        let error = match self.attempt(record).await {
            Ok(()) => {
                if self.store.complete(record.id, owner).await? {
                    debug!(sweeper = %owner, retry_id = %record.id, "retry succeeded");
                    report.succeeded += 1;
                } else {
                    report.lost_claims += 1;
                }
                return Ok(());
            }
            Err(e) => e.to_string(),
        };

        match record.after_failed_sweep(&self.policy, now) {
            SweepDecision::Reschedule {
                attempts,
                next_retry_at,
            } => {
                if self
                    .store
                    .reschedule(record.id, owner, attempts, next_retry_at, &error, now)
                    .await?
                {
                    debug!(
                        sweeper = %owner,
                        retry_id = %record.id,
                        attempts,
                        next_retry_at = %next_retry_at,
                        error = %error,
                        "retry failed, rescheduled"
                    );
                    report.rescheduled += 1;
                } else {
                    report.lost_claims += 1;
                }
            }
            SweepDecision::DeadLetter { attempts } => {
                if !self.store.dead_letter(record.id, owner, attempts, &error, now).await? {
                    report.lost_claims += 1;
                    return Ok(());
                }

                error!(
                    sweeper = %owner,
                    retry_id = %record.id,
                    aggregate_id = %record.aggregate_id,
                    version = record.version,
                    event_type = %record.event_type,
                    attempts,
                    error = %error,
                    "projection retries exhausted, record dead-lettered"
                );
                report.dead_lettered += 1;

                if let Some(sink) = &self.dead_letters {
                    let mut notice = DeadLetterNotice::from_record(record, now);
                    notice.attempts = attempts;
                    notice.error = error;
                    if let Err(e) = sink.notify(&notice).await {
                        warn!(sweeper = %owner, retry_id = %record.id, error = %e, "dead-letter notification failed");
                    }
                }
            }
        }

        Ok(())
    }

    async fn attempt(&self, record: &RetryRecord) -> Result<(), ProjectionError> {
        let envelope = record
            .envelope()
            .map_err(|e| ProjectionError::Permanent(e.to_string()))?;

        match tokio::time::timeout(self.config.projection_timeout, self.applier.apply(&envelope)).await {
            Ok(result) => result,
            Err(_) => Err(ProjectionError::Transient(format!(
                "timed out after {:?}",
                self.config.projection_timeout
            ))),
        }
    }
}

impl<R, A> RetrySweeper<R, A>
where
    R: RetryStore + 'static,
    A: ProjectionApplier + 'static,
{
    /// Run the sweeper on the current tokio runtime until shut down.
    pub fn spawn(self) -> SweeperHandle {
        let shutdown = Arc::new(Notify::new());
        let join = tokio::spawn(self.run(shutdown.clone()));
        SweeperHandle { shutdown, join }
    }

    async fn run(self, shutdown: Arc<Notify>) {
        let name = self.config.name.clone();
        info!(
            sweeper = %name,
            projection = self.applier.name(),
            poll_interval = ?self.config.poll_interval,
            "retry sweeper started"
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                _ = ticker.tick() => {
                    match self.sweep_once(Utc::now()).await {
                        Ok(report) if report.claimed > 0 => {
                            info!(
                                sweeper = %name,
                                claimed = report.claimed,
                                succeeded = report.succeeded,
                                rescheduled = report.rescheduled,
                                dead_lettered = report.dead_lettered,
                                lost_claims = report.lost_claims,
                                "sweep finished"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(sweeper = %name, error = %e, "failed to claim due retry records"),
                    }
                }
            }
        }

        info!(sweeper = %name, "retry sweeper stopped");
    }
}
