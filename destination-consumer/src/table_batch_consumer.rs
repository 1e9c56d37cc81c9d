use std::sync::Arc;

use async_trait::async_trait;
use common_kafka::errors::{is_retriable, read_message};
use common_kafka::headers::{
    build_retry_headers, format_retry_time, get_header, retries_count, MESSAGE_ID_HEADER,
};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::OwnedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use sink_core::topic::{BusMode, TopicId};
use sink_core::{decode_event, BulkMode, SinkStream};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::backoff::next_retry_time;
use crate::batch_consumer::{
    BatchConsumer, BatchConsumerCore, BatchCounters, BatchFunction, BatchResult,
    PausingConsumerContext, SEEK_TIMEOUT,
};
use crate::config::Config;
use crate::destination::{Destination, Repository};
use crate::errors::ConsumerError;
use crate::events_log::{post_events_log, EventsLogService};
use crate::metrics;

/// Periodic consumer over a destination's primary table topic: drains up to
/// one batch of events into a Batch-mode sink stream and commits offsets once
/// the sink has persisted them. A failed batch is aborted sink-side and every
/// consumed event is rescheduled through the retry pipeline, atomically with
/// the offset commit.
pub struct TableBatchConsumer {
    core: Arc<BatchConsumerCore>,
    events_log: Arc<dyn EventsLogService>,
}

impl TableBatchConsumer {
    pub async fn new(
        repository: Arc<Repository>,
        topic_id: &str,
        batch_period_sec: u64,
        config: Arc<Config>,
        events_log: Arc<dyn EventsLogService>,
    ) -> Result<Arc<Self>, ConsumerError> {
        let core = BatchConsumerCore::new(
            repository,
            topic_id,
            batch_period_sec,
            BusMode::Batch,
            config,
        )
        .await?;
        core.pause();
        Ok(Arc::new(Self { core, events_log }))
    }

    fn message_metric(&self, status: &str, count: u64) {
        let topic = self.core.topic();
        metrics::consumer_messages(
            self.core.topic_id(),
            topic.mode.as_str(),
            &topic.destination_id,
            &topic.table_name,
            status,
            count,
        );
    }

    async fn process_table_batch(
        &self,
        destination: &Arc<Destination>,
        batch_size: usize,
    ) -> BatchResult {
        let core = &self.core;
        let consumer = core.consumer();
        let topic_id = core.topic_id().to_string();
        let table_name = core.topic().table_name.clone();

        let mut counters = BatchCounters::default();
        let mut next_batch = true;

        let high_watermark = match consumer.fetch_watermarks(&topic_id, 0, SEEK_TIMEOUT) {
            Ok((_low, high)) => Some(high),
            Err(err) => {
                warn!(topic = %topic_id, "Failed to query watermark offsets: {err}");
                None
            }
        };

        let stream = match destination
            .create_stream(&topic_id, &table_name, BulkMode::Batch)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                core.error_metric("failed to create sink stream");
                return BatchResult {
                    counters,
                    next_batch: false,
                    error: Some(err.into()),
                };
            }
        };

        let mut messages: Vec<OwnedMessage> = Vec::new();
        let mut sink_failure: Option<String> = None;
        let mut slept_on_error = false;
        while messages.len() < batch_size {
            if core.is_retired() {
                break;
            }
            if let (Some(high), Some(last)) = (high_watermark, messages.last().map(|m| m.offset()))
            {
                if last >= high - 1 {
                    next_batch = false;
                    debug!(
                        topic = %topic_id,
                        "Reached watermark offset {}. Stopping batch",
                        high - 1
                    );
                    break;
                }
            }
            let message = match read_message(&consumer, core.wait_for_messages()).await {
                Ok(Some(message)) => message,
                Ok(None) => {
                    next_batch = false;
                    break;
                }
                Err(err) if is_retriable(&err) && !slept_on_error => {
                    slept_on_error = true;
                    sleep(core.wait_for_messages() * 10).await;
                    continue;
                }
                Err(err) => {
                    if let Err(abort_err) = stream.abort().await {
                        warn!(topic = %topic_id, "Failed to abort sink stream: {abort_err}");
                    }
                    return core.rewind_and_abort(
                        &consumer,
                        messages.first().map(|m| m.offset()),
                        None,
                        counters,
                        err.into(),
                    );
                }
            };
            counters.consumed += 1;
            let outcome = self.feed_sink(stream.as_ref(), destination, &message).await;
            messages.push(message);
            if let Err(failure) = outcome {
                counters.failed += 1;
                sink_failure = Some(failure);
                break;
            }
        }

        if messages.is_empty() {
            if let Err(err) = stream.abort().await {
                debug!(topic = %topic_id, "abort of empty sink stream: {err}");
            }
            return BatchResult {
                counters,
                next_batch,
                error: None,
            };
        }
        let first_offset = messages.first().map(|m| m.offset());
        let last_offset = messages.last().map(|m| m.offset()).unwrap_or(0);

        if sink_failure.is_none() {
            match stream.complete().await {
                Ok(state) => {
                    debug!(topic = %topic_id, "Batch stream completed: {state:?}");
                }
                Err(err) => sink_failure = Some(err.to_string()),
            }
        }

        match sink_failure {
            None => {
                let mut offsets = TopicPartitionList::new();
                let commit = offsets
                    .add_partition_offset(&topic_id, 0, Offset::Offset(last_offset + 1))
                    .and_then(|_| consumer.commit(&offsets, CommitMode::Sync));
                if let Err(err) = commit {
                    // The sink already persisted this batch; redelivery will
                    // rely on sink-side de-duplication.
                    core.error_metric("offset_commit_error");
                    error!(topic = %topic_id, "Failed to commit offsets after completed batch: {err}");
                    return BatchResult {
                        counters,
                        next_batch: false,
                        error: Some(err.into()),
                    };
                }
                counters.processed += messages.len() as u64;
                self.message_metric("processed", messages.len() as u64);
                BatchResult {
                    counters,
                    next_batch,
                    error: None,
                }
            }
            Some(failure) => {
                if let Err(err) = stream.abort().await {
                    warn!(topic = %topic_id, "Failed to abort sink stream: {err}");
                }
                self.route_failed_batch(&consumer, &messages, first_offset, last_offset, counters, failure)
                    .await
            }
        }
    }

    /// Decodes one event and feeds it into the sink stream, posting the
    /// events log either way. Errors come back as the failure text that will
    /// end the batch.
    async fn feed_sink(
        &self,
        stream: &dyn SinkStream,
        destination: &Arc<Destination>,
        message: &OwnedMessage,
    ) -> Result<(), String> {
        let payload = message.payload().unwrap_or(&[]);
        let object = match decode_event(payload) {
            Ok(object) => object,
            Err(err) => {
                self.core.error_metric("parse_event_error");
                post_events_log(
                    self.events_log.as_ref(),
                    destination.id(),
                    payload,
                    None,
                    &[],
                    Some(&err.to_string()),
                )
                .await;
                error!(
                    topic = self.core.topic_id(),
                    offset = message.offset(),
                    "Failed to parse event from message: {err}"
                );
                return Err(err.to_string());
            }
        };
        match stream.consume(object).await {
            Ok(outcome) => {
                post_events_log(
                    self.events_log.as_ref(),
                    destination.id(),
                    payload,
                    outcome.state.representation.as_ref(),
                    &outcome.processed,
                    None,
                )
                .await;
                Ok(())
            }
            Err(err) => {
                self.core.error_metric("sink_stream_error");
                post_events_log(
                    self.events_log.as_ref(),
                    destination.id(),
                    payload,
                    None,
                    &[],
                    Some(&err.to_string()),
                )
                .await;
                error!(
                    topic = self.core.topic_id(),
                    "Failed to inject event to sink stream: {err}"
                );
                Err(err.to_string())
            }
        }
    }

    /// Reschedules every consumed message through the retry pipeline (dead
    /// letter once attempts are exhausted) and advances the source offsets in
    /// the same transaction, so an aborted sink batch is never lost and never
    /// reprocessed from the primary topic.
    async fn route_failed_batch(
        &self,
        consumer: &StreamConsumer<PausingConsumerContext>,
        messages: &[OwnedMessage],
        first_offset: Option<i64>,
        last_offset: i64,
        mut counters: BatchCounters,
        failure: String,
    ) -> BatchResult {
        let core = &self.core;
        let config = core.config().clone();
        let topic_id = core.topic_id().to_string();
        let destination_id = core.topic().destination_id.clone();
        let retry_topic = TopicId::retry_for(&destination_id).to_string();
        let dead_topic = TopicId::dead_for(&destination_id).to_string();

        let mut producer = core.producer.lock().await;
        let tx = match producer.begin() {
            Ok(tx) => tx,
            Err(err) => {
                return core.rewind_and_abort(consumer, first_offset, None, counters, err.into())
            }
        };

        for message in messages {
            let message_id = get_header(message, MESSAGE_ID_HEADER).unwrap_or_default().to_string();
            let retries = retries_count(message).unwrap_or_else(|err| {
                error!(topic = %topic_id, "failed to read retry header: {err}");
                0
            });
            let target = if retries >= config.messages_retry_count {
                counters.dead_lettered += 1;
                &dead_topic
            } else {
                counters.retry_scheduled += 1;
                &retry_topic
            };
            let deadline = format_retry_time(next_retry_time(&config, retries + 1));
            let headers =
                build_retry_headers(&topic_id, retries, Some(&deadline), Some(&message_id));
            if let Err(err) = tx.send(
                target,
                message.key(),
                message.payload().unwrap_or(&[]),
                headers,
                &message_id,
            ) {
                return core.rewind_and_abort(consumer, first_offset, Some(tx), counters, err.into());
            }
        }

        let Some(metadata) = consumer.group_metadata() else {
            return core.rewind_and_abort(
                consumer,
                first_offset,
                Some(tx),
                counters,
                ConsumerError::Internal("failed to get consumer group metadata".to_string()),
            );
        };
        let mut offsets = TopicPartitionList::new();
        if let Err(err) = offsets.add_partition_offset(&topic_id, 0, Offset::Offset(last_offset + 1))
        {
            return core.rewind_and_abort(consumer, first_offset, Some(tx), counters, err.into());
        }
        if let Err(err) = tx.associate_offsets(&offsets, &metadata) {
            return core.rewind_and_abort(consumer, first_offset, Some(tx), counters, err.into());
        }
        if let Err(err) = tx.commit() {
            return core.rewind_and_abort(consumer, first_offset, None, counters, err.into());
        }

        BatchResult {
            counters,
            next_batch: false,
            error: Some(ConsumerError::Internal(format!(
                "batch failed and was rescheduled for retry: {failure}"
            ))),
        }
    }
}

#[async_trait]
impl BatchFunction for TableBatchConsumer {
    async fn process_batch(
        &self,
        destination: &Arc<Destination>,
        _batch_number: u64,
        batch_size: usize,
        _retry_batch_size: usize,
    ) -> BatchResult {
        self.process_table_batch(destination, batch_size).await
    }
}

#[async_trait]
impl BatchConsumer for TableBatchConsumer {
    async fn run_job(&self) {
        let _ = self.consume_all().await;
    }

    async fn consume_all(&self) -> Result<BatchCounters, ConsumerError> {
        BatchConsumerCore::consume_all(&self.core, self).await
    }

    fn retire(&self) {
        self.core.retire();
    }

    fn is_retired(&self) -> bool {
        self.core.is_retired()
    }

    fn batch_period_sec(&self) -> u64 {
        self.core.batch_period_sec()
    }

    fn update_batch_period(&self, batch_period_sec: u64) {
        self.core.update_batch_period(batch_period_sec);
    }

    fn topic_id(&self) -> &str {
        self.core.topic_id()
    }
}
