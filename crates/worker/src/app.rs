use std::sync::Arc;

use anyhow::Context;
use sqlx::PgPool;
use tracing::info;

use chronicle_infra::config::Config;
use chronicle_infra::db;
use chronicle_infra::event_bus::{RedisStreamsConsumer, RedisStreamsDeadLetterSink};
use chronicle_infra::projections::OrderStatusProjection;
use chronicle_infra::read_model::PostgresOrderViewStore;
use chronicle_infra::retry::{DeadLetterSink, PostgresRetryStore, RetryId, RetryRecord, RetryStore, RetrySweeper};
use chronicle_infra::workers::ProjectionWorker;
use chronicle_orders::order_registry;

struct Pools {
    ledger: PgPool,
    read_model: PgPool,
}

async fn pools(config: &Config) -> anyhow::Result<Pools> {
    let ledger = db::connect(&config.database_url)
        .await
        .context("connecting to ledger database")?;
    db::migrate(&ledger).await.context("migrating ledger database")?;

    let read_model = if config.read_model_database_url == config.database_url {
        ledger.clone()
    } else {
        let pool = db::connect(&config.read_model_database_url)
            .await
            .context("connecting to read-model database")?;
        db::migrate(&pool).await.context("migrating read-model database")?;
        pool
    };

    Ok(Pools { ledger, read_model })
}

/// Run the projection worker, retry sweeper and stale-entry reclaimer until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let pools = pools(&config).await?;
    let redis = redis::Client::open(config.redis_url.as_str()).context("invalid REDIS_URL")?;

    let consumer = Arc::new(
        RedisStreamsConsumer::connect(
            &redis,
            &config.events_topic,
            config.events_partitions,
            config.consumer_group.clone(),
            config.consumer_name.clone(),
        )
        .await?,
    );
    let dead_letters: Arc<dyn DeadLetterSink> =
        Arc::new(RedisStreamsDeadLetterSink::connect(&redis, &config.events_topic).await?);

    let views = Arc::new(PostgresOrderViewStore::new(pools.read_model));
    let projection = Arc::new(OrderStatusProjection::new(views, order_registry()?));
    let retries = Arc::new(PostgresRetryStore::new(pools.ledger));
    let policy = config.backoff_policy();

    let worker = ProjectionWorker::new(
        consumer.clone(),
        projection.clone(),
        retries.clone(),
        policy.clone(),
        config.worker_config(),
    )
    .with_dead_letter_sink(dead_letters.clone())
    .spawn();

    let sweeper = RetrySweeper::new(retries, projection, policy, config.sweeper_config())
        .with_dead_letter_sink(dead_letters)
        .spawn();

    let reclaimer = consumer.spawn_reclaimer(config.sweep_lease, config.sweep_batch_size);

    info!(
        consumer = %config.consumer_name,
        group = %config.consumer_group,
        topic = %config.events_topic,
        partitions = config.events_partitions,
        "worker started"
    );

    tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
    info!("shutdown requested");

    worker.shutdown().await;
    sweeper.shutdown().await;
    reclaimer.shutdown().await;

    info!("worker stopped");
    Ok(())
}

async fn retry_store(config: &Config) -> anyhow::Result<PostgresRetryStore> {
    let pool = db::connect(&config.database_url)
        .await
        .context("connecting to ledger database")?;
    Ok(PostgresRetryStore::new(pool))
}

fn summary(record: &RetryRecord) -> serde_json::Value {
    serde_json::json!({
        "id": record.id.to_string(),
        "aggregate_id": record.aggregate_id.as_str(),
        "version": record.version,
        "event_type": record.event_type,
        "status": record.status.as_str(),
        "attempts": record.attempts,
        "max_attempts": record.max_attempts,
        "last_error": record.last_error,
        "next_retry_at": record.next_retry_at.to_rfc3339(),
        "updated_at": record.updated_at.to_rfc3339(),
    })
}

/// Print dead letters as JSON lines, most recent first.
pub async fn list_dead_letters(config: &Config, limit: usize) -> anyhow::Result<()> {
    let store = retry_store(config).await?;
    for record in store.list_dead_letters(limit).await? {
        println!("{}", summary(&record));
    }
    Ok(())
}

pub async fn requeue(config: &Config, id: RetryId) -> anyhow::Result<()> {
    let store = retry_store(config).await?;
    let record = store
        .requeue_dead_letter(id, chrono::Utc::now())
        .await
        .with_context(|| format!("requeueing {id}"))?;
    info!(retry_id = %id, aggregate_id = %record.aggregate_id, version = record.version, "dead letter requeued");
    println!("{}", summary(&record));
    Ok(())
}

pub async fn stats(config: &Config) -> anyhow::Result<()> {
    let store = retry_store(config).await?;
    println!("{}", serde_json::to_string(&store.stats().await?)?);
    Ok(())
}
