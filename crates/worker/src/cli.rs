use clap::{Parser, Subcommand};

use chronicle_infra::retry::RetryId;

/// Order read-model worker and retry-ledger tooling.
///
/// Configuration comes from the environment (`DATABASE_URL`, `REDIS_URL`, ...).
#[derive(Debug, Parser)]
#[command(name = "chronicle-worker", version, propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Subcommand)]
pub enum Commands {
    /// Consume events and sweep retries until Ctrl-C (default)
    #[default]
    Run,

    /// List dead-lettered projection failures
    #[command(visible_alias = "dlq")]
    DeadLetters {
        #[arg(default_value_t = 50)]
        limit: usize,
    },

    /// Move a dead letter back to pending, due immediately
    Requeue { id: RetryId },

    /// Pending / dead-lettered / claimed counts
    Stats,
}
