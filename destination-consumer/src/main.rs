use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use futures::future::ready;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use sink_core::topic::{BusMode, TopicId};
use sink_core::{StdoutSinkFactory, BulkMode, BATCH_FREQUENCY_OPTION, RETRY_FREQUENCY_OPTION};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use destination_consumer::batch_consumer::BatchConsumer;
use destination_consumer::config::Config;
use destination_consumer::destination::{Destination, DestinationConfig, Repository};
use destination_consumer::events_log::{EventsLogService, NoopEventsLog};
use destination_consumer::retry_consumer::RetryConsumer;
use destination_consumer::stream_consumer::StreamConsumer;
use destination_consumer::table_batch_consumer::TableBatchConsumer;

pub async fn index() -> &'static str {
    "destination consumer service"
}

fn start_server(config: &Config, metrics_handle: PrometheusHandle) -> JoinHandle<()> {
    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(|| ready("ok")))
        .route("/metrics", get(move || ready(metrics_handle.render())));
    let bind = config.bind_address();

    tokio::task::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .expect("failed to bind http server");
        axum::serve(listener, router)
            .await
            .expect("failed to start serving metrics");
    })
}

fn period_sec(frequency_min: f64, default_sec: u64) -> u64 {
    if frequency_min > 0.0 {
        (frequency_min * 60.0) as u64
    } else {
        default_sec
    }
}

/// Stand-in for the cron wiring: one interval loop per batch consumer,
/// re-reading the period each tick so `update_batch_period` takes effect.
fn spawn_batch_runner(consumer: Arc<dyn BatchConsumer>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(consumer.batch_period_sec().max(1))).await;
            if consumer.is_retired() {
                return;
            }
            consumer.run_job().await;
        }
    })
}

fn load_destinations(config: &Config) -> Result<Vec<DestinationConfig>> {
    match &config.destinations_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read destinations file {path}"))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse destinations file {path}"))
        }
        None => Ok(Vec::new()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::init().context("Failed to load configuration from environment")?);
    info!("Starting destination consumer. Instance: {}", config.instance_id());

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    let server_handle = start_server(&config, metrics_handle);
    info!("Started http server on {}", config.bind_address());

    let repository = Arc::new(Repository::new());
    for destination_config in load_destinations(&config)? {
        let destination = Destination::new(destination_config, Arc::new(StdoutSinkFactory))
            .context("invalid destination config")?;
        repository.publish(Arc::new(destination));
    }

    let producer = common_kafka::create_producer(&config.kafka)
        .context("failed to create kafka producer")?;
    let events_log: Arc<dyn EventsLogService> = Arc::new(NoopEventsLog);

    let mut stream_consumers = Vec::new();
    let mut batch_consumers: Vec<Arc<dyn BatchConsumer>> = Vec::new();

    for id in repository.ids() {
        let Some(destination) = repository.get(&id) else {
            continue;
        };
        let options = destination.stream_options();
        match destination.mode() {
            BulkMode::Stream => {
                for table in &destination.config().tables {
                    let topic_id = TopicId::new(&id, BusMode::Stream, table).to_string();
                    match StreamConsumer::new(
                        destination.clone(),
                        &topic_id,
                        config.clone(),
                        producer.clone(),
                        events_log.clone(),
                    )
                    .await
                    {
                        Ok(consumer) => stream_consumers.push(consumer),
                        Err(err) => {
                            error!("failed to create stream consumer for {topic_id}: {err}")
                        }
                    }
                }
            }
            BulkMode::Batch => {
                let period = period_sec(
                    BATCH_FREQUENCY_OPTION.get(options),
                    config.batch_runner_default_period_sec,
                );
                for table in &destination.config().tables {
                    let topic_id = TopicId::new(&id, BusMode::Batch, table).to_string();
                    match TableBatchConsumer::new(
                        repository.clone(),
                        &topic_id,
                        period,
                        config.clone(),
                        events_log.clone(),
                    )
                    .await
                    {
                        Ok(consumer) => batch_consumers.push(consumer),
                        Err(err) => {
                            error!("failed to create batch consumer for {topic_id}: {err}")
                        }
                    }
                }
            }
            BulkMode::Unknown => {
                warn!("destination {id} has no usable mode option; skipping consumers");
                continue;
            }
        }

        let retry_period = period_sec(
            RETRY_FREQUENCY_OPTION.get(options),
            config.batch_runner_default_retry_period_sec,
        );
        let retry_topic = TopicId::retry_for(&id).to_string();
        match RetryConsumer::new(repository.clone(), &retry_topic, retry_period, config.clone())
            .await
        {
            Ok(consumer) => batch_consumers.push(consumer),
            Err(err) => error!("failed to create retry consumer for {retry_topic}: {err}"),
        }
    }
    info!(
        "Running {} stream consumer(s) and {} batch consumer(s)",
        stream_consumers.len(),
        batch_consumers.len()
    );

    let runner_handles: Vec<_> = batch_consumers
        .iter()
        .map(|consumer| spawn_batch_runner(consumer.clone()))
        .collect();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutting down");

    for consumer in &batch_consumers {
        consumer.retire();
    }
    for consumer in &stream_consumers {
        consumer.close().await;
    }
    for handle in runner_handles {
        handle.abort();
    }
    server_handle.abort();

    Ok(())
}
