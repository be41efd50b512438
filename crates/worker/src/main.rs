use clap::Parser;

use chronicle_infra::config::Config;
use chronicle_worker::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    chronicle_observability::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command.unwrap_or_default() {
        Commands::Run => chronicle_worker::app::run(config).await,
        Commands::DeadLetters { limit } => chronicle_worker::app::list_dead_letters(&config, limit).await,
        Commands::Requeue { id } => chronicle_worker::app::requeue(&config, id).await,
        Commands::Stats => chronicle_worker::app::stats(&config).await,
    }
}
