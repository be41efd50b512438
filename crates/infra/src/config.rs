//! Process configuration from environment variables.
//!
//! Every knob has a default except `DATABASE_URL`. Values are validated once at
//! startup; nothing downstream re-reads the environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::command_dispatcher::DispatchConfig;
use crate::retry::{BackoffPolicy, BackoffStrategy, SweeperConfig};
use crate::workers::WorkerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    /// Defaults to `database_url`.
    pub read_model_database_url: String,
    pub redis_url: String,
    pub events_topic: String,
    pub events_partitions: u32,
    pub consumer_group: String,
    /// Consumer name in the group; also the sweeper's claim owner.
    pub consumer_name: String,
    pub retry_base_interval: Duration,
    pub max_retries: u32,
    pub retry_backoff: BackoffStrategy,
    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,
    pub sweep_lease: Duration,
    pub publish_timeout: Duration,
    pub projection_timeout: Duration,
    pub max_conflict_retries: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from an arbitrary variable lookup. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |var: &str| lookup(var).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let read_model_database_url = get("READMODEL_DATABASE_URL").unwrap_or_else(|| database_url.clone());

        let sweep_lease = Duration::from_secs(parse_at_least(&get, "SWEEP_LEASE_SECS", 60, 1)?);
        let projection_timeout = Duration::from_millis(parse_at_least(&get, "PROJECTION_TIMEOUT_MS", 5000, 1)?);
        // A claim must outlive the retry it guards.
        if sweep_lease <= projection_timeout {
            return Err(ConfigError::Invalid {
                var: "SWEEP_LEASE_SECS",
                value: sweep_lease.as_secs().to_string(),
                reason: format!("must exceed PROJECTION_TIMEOUT_MS ({}ms)", projection_timeout.as_millis()),
            });
        }

        Ok(Self {
            read_model_database_url,
            database_url,
            redis_url: get("REDIS_URL").unwrap_or_else(|| "redis://localhost:6379".to_string()),
            events_topic: get("EVENTS_TOPIC").unwrap_or_else(|| "chronicle:events".to_string()),
            events_partitions: parse_at_least(&get, "EVENTS_PARTITIONS", 4, 1)?,
            consumer_group: get("CONSUMER_GROUP").unwrap_or_else(|| "order-read-model".to_string()),
            consumer_name: get("CONSUMER_NAME").unwrap_or_else(|| format!("worker-{}", Uuid::now_v7())),
            retry_base_interval: Duration::from_secs(parse_at_least(&get, "RETRY_BASE_INTERVAL_SECS", 10, 1)?),
            max_retries: parse_at_least(&get, "MAX_RETRIES", 5, 1)?,
            retry_backoff: parse_or(&get, "RETRY_BACKOFF", BackoffStrategy::Quadratic)?,
            sweep_interval: Duration::from_secs(parse_at_least(&get, "SWEEP_INTERVAL_SECS", 5, 1)?),
            sweep_batch_size: parse_at_least(&get, "SWEEP_BATCH_SIZE", 100, 1)?,
            sweep_lease,
            publish_timeout: Duration::from_millis(parse_at_least(&get, "PUBLISH_TIMEOUT_MS", 5000, 1)?),
            projection_timeout,
            max_conflict_retries: parse_or(&get, "MAX_CONFLICT_RETRIES", 3)?,
        })
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.retry_base_interval, self.max_retries).with_strategy(self.retry_backoff)
    }

    pub fn sweeper_config(&self) -> SweeperConfig {
        SweeperConfig::default()
            .with_name(self.consumer_name.clone())
            .with_poll_interval(self.sweep_interval)
            .with_batch_size(self.sweep_batch_size)
            .with_lease(self.sweep_lease)
            .with_projection_timeout(self.projection_timeout)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_name(self.consumer_name.clone())
            .with_projection_timeout(self.projection_timeout)
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_conflict_retries: self.max_conflict_retries,
            publish_timeout: self.publish_timeout,
        }
    }
}

fn parse_or<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(var) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_at_least<T>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
    min: T,
) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + std::fmt::Display + Copy,
    T::Err: std::fmt::Display,
{
    let parsed = parse_or(get, var, default)?;
    if parsed < min {
        return Err(ConfigError::Invalid {
            var,
            value: parsed.to_string(),
            reason: format!("must be at least {min}"),
        });
    }
    Ok(parsed)
}
