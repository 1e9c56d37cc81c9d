use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

/// Plain (non-transactional) producer shared by stream consumers for writing
/// to retry and dead-letter topics.
pub fn create_producer(config: &KafkaConfig) -> Result<FutureProducer, KafkaError> {
    let client_config = config.producer_client_config(None);
    debug!("rdkafka configuration: {:?}", client_config);
    let producer: FutureProducer = client_config.create()?;

    // "Ping" the Kafka brokers by requesting metadata
    match producer
        .client()
        .fetch_metadata(None, Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(err) => {
            error!("Failed to fetch metadata from Kafka brokers: {err:?}");
            return Err(err);
        }
    }

    Ok(producer)
}

/// Produces one record and waits for its delivery report.
pub async fn produce_sync(
    producer: &FutureProducer,
    topic: &str,
    key: Option<&[u8]>,
    payload: &[u8],
    headers: OwnedHeaders,
) -> Result<(), KafkaError> {
    let record: FutureRecord<'_, [u8], [u8]> =
        FutureRecord::to(topic).payload(payload).headers(headers);
    let record = match key {
        Some(key) => record.key(key),
        None => record,
    };
    producer
        .send(record, Timeout::Never)
        .await
        .map(|_delivery| ())
        .map_err(|(err, _message)| err)
}
