use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::consumer::{create_consumer, run_consumer, Worker};
use crate::fetcher::HttpFetcher;
use crate::health::HealthRegistry;
use crate::producer::{ensure_topics, KafkaTaskSink};
use crate::router::router;
use crate::service::MetadataService;
use crate::store::MongoStore;

const LIVENESS_DEADLINE: Duration = Duration::from_secs(60);

/// Bring up every process-wide handle in dependency order, serve until
/// `shutdown` resolves, then tear everything down in reverse order.
pub async fn serve<F>(config: Config, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");

    let store = MongoStore::connect(&config.mongo_uri, &config.mongo_db_name).await?;
    store.ensure_indexes().await?;

    ensure_topics(&config.kafka).await?;

    let sink = Arc::new(KafkaTaskSink::new(
        &config.kafka,
        liveness.register("producer", LIVENESS_DEADLINE),
    )?);
    let fetcher = Arc::new(HttpFetcher::new(Duration::from_secs(config.http_timeout))?);

    let service = Arc::new(MetadataService::new(
        Arc::new(store.clone()),
        sink.clone(),
        fetcher.clone(),
    ));

    let consumer = create_consumer(&config.kafka)?;
    let worker = Worker::new(
        Arc::new(store.clone()),
        sink.clone(),
        fetcher,
        config.kafka.max_retries,
    );
    let consumer_shutdown = CancellationToken::new();
    let consumer_task = tokio::spawn(run_consumer(
        consumer,
        worker,
        liveness.register("consumer", LIVENESS_DEADLINE),
        consumer_shutdown.clone(),
    ));

    let app = router(service, liveness, true);
    let listener = tokio::net::TcpListener::bind(config.bind()).await?;
    info!(address = %config.bind(), "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    // Reverse of startup: stop the consumer, flush the producer, close the
    // store.
    consumer_shutdown.cancel();
    if let Err(err) = consumer_task.await {
        error!(error = %err, "consumer task panicked");
    }
    sink.close();
    store.close().await;
    info!("shutdown complete");

    Ok(())
}
