use std::time::Duration;

use rdkafka::consumer::ConsumerGroupMetadata;
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::{DeliveryFuture, FutureProducer, FutureRecord, Producer};
use rdkafka::TopicPartitionList;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

/// Transactional producer used by batch consumers to write retry/dead-letter
/// messages and commit source offsets atomically. Each consumer owns exactly
/// one; the transactional id fences zombie instances.
pub struct TransactionalProducer {
    inner: FutureProducer,
    timeout: Duration,
    delivery_tx: mpsc::UnboundedSender<(String, DeliveryFuture)>,
}

/// Receiver half of the delivery-report stream; the owning consumer drains it
/// in a background task so every produce outcome is logged.
pub struct DeliveryReports {
    rx: mpsc::UnboundedReceiver<(String, DeliveryFuture)>,
}

impl DeliveryReports {
    /// Logs delivery outcomes until the producer is dropped.
    pub async fn drain(mut self) {
        while let Some((message_id, delivery)) = self.rx.recv().await {
            match delivery.await {
                Ok(Ok(_)) => {
                    debug!(%message_id, "message delivered");
                }
                Ok(Err((err, _))) => {
                    error!(%message_id, "error delivering message: {err}");
                }
                Err(_) => {
                    error!(%message_id, "message delivery canceled");
                }
            }
        }
    }
}

impl TransactionalProducer {
    pub fn new(
        config: &KafkaConfig,
        transactional_id: &str,
        timeout: Duration,
    ) -> Result<(Self, DeliveryReports), KafkaError> {
        let client_config = config.producer_client_config(Some(transactional_id));
        debug!("rdkafka configuration: {:?}", client_config);
        let inner: FutureProducer = client_config.create()?;

        // "Ping" the brokers by requesting metadata before entering the
        // transactional state machine.
        match inner
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

        inner.init_transactions(timeout)?;

        let (delivery_tx, rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                inner,
                timeout,
                delivery_tx,
            },
            DeliveryReports { rx },
        ))
    }

    pub fn begin(&mut self) -> Result<KafkaTransaction<'_>, KafkaError> {
        self.inner.begin_transaction()?;
        Ok(KafkaTransaction { producer: self })
    }
}

/// An open producer transaction. Mutably borrows the producer: Kafka permits
/// only one transaction per producer at a time.
pub struct KafkaTransaction<'a> {
    producer: &'a mut TransactionalProducer,
}

impl KafkaTransaction<'_> {
    /// Queues a record inside the transaction. The delivery report is handed
    /// to the drain loop; a failed delivery surfaces at `commit`.
    pub fn send(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        headers: OwnedHeaders,
        message_id: &str,
    ) -> Result<(), KafkaError> {
        let record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(topic).payload(payload).headers(headers);
        let record = match key {
            Some(key) => record.key(key),
            None => record,
        };
        match self.producer.inner.send_result(record) {
            Ok(delivery) => {
                let _ = self
                    .producer
                    .delivery_tx
                    .send((message_id.to_string(), delivery));
                Ok(())
            }
            Err((err, _record)) => Err(err),
        }
    }

    /// Attaches consumer offsets to the transaction. Offsets must point at
    /// the next message the group will consume (last processed + 1).
    pub fn associate_offsets(
        &self,
        offsets: &TopicPartitionList,
        metadata: &ConsumerGroupMetadata,
    ) -> Result<(), KafkaError> {
        self.producer
            .inner
            .send_offsets_to_transaction(offsets, metadata, self.producer.timeout)
    }

    pub fn commit(self) -> Result<(), KafkaError> {
        self.producer.inner.commit_transaction(self.producer.timeout)
    }

    pub fn abort(self) -> Result<(), KafkaError> {
        self.producer.inner.abort_transaction(self.producer.timeout)
    }
}
