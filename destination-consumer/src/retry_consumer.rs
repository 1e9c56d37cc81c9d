use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_kafka::errors::{is_retriable, read_message};
use common_kafka::headers::{
    build_retry_headers, get_header, retries_count, retry_time, MESSAGE_ID_HEADER,
    ORIGINAL_TOPIC_HEADER, RETRY_TIME_HEADER,
};
use common_kafka::transaction::KafkaTransaction;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::OwnedMessage;
use rdkafka::{Message, Offset, TopicPartitionList};
use sink_core::topic::{BusMode, TopicId};
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::batch_consumer::{
    BatchConsumer, BatchConsumerCore, BatchCounters, BatchFunction, BatchResult,
    PausingConsumerContext, SEEK_TIMEOUT,
};
use crate::config::Config;
use crate::destination::{Destination, Repository};
use crate::errors::ConsumerError;

/// Where an already-failed message goes next.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RetryDisposition {
    /// Unusable envelope; the message is dropped from the pipeline.
    Skip(&'static str),
    /// No attempts left; park on the dead-letter topic.
    DeadLetter {
        original_topic: String,
        retries: i32,
    },
    /// Deadline not reached; requeue on the retry topic, deadline untouched.
    Requeue {
        original_topic: String,
        retries: i32,
        retry_time: String,
    },
    /// Due now; send back to the original topic with the attempt recorded.
    Retry {
        original_topic: String,
        retries: i32,
    },
}

/// Pure classification of a retry-topic message. A missing deadline, an
/// unparseable one, or one in the past all mean "due now".
pub(crate) fn classify<M: Message>(
    message: &M,
    now: DateTime<Utc>,
    max_retries: i32,
) -> RetryDisposition {
    let Some(original_topic) = get_header(message, ORIGINAL_TOPIC_HEADER) else {
        return RetryDisposition::Skip("Failed to get original topic from message headers");
    };
    let original_topic = original_topic.to_string();
    let retries = match retries_count(message) {
        Ok(retries) => retries,
        Err(_) => return RetryDisposition::Skip("Failed to get retries count from message headers"),
    };
    if retries >= max_retries {
        return RetryDisposition::DeadLetter {
            original_topic,
            retries,
        };
    }
    match retry_time(message) {
        Ok(Some(deadline)) if deadline > now => RetryDisposition::Requeue {
            original_topic,
            retries,
            retry_time: get_header(message, RETRY_TIME_HEADER)
                .unwrap_or_default()
                .to_string(),
        },
        _ => RetryDisposition::Retry {
            original_topic,
            retries: retries + 1,
        },
    }
}

/// Periodic consumer over a destination's retry topic: reclassifies failed
/// messages into retry-now, requeue-later, or dead-letter, atomically with
/// the source offset commit.
pub struct RetryConsumer {
    core: Arc<BatchConsumerCore>,
}

impl RetryConsumer {
    pub async fn new(
        repository: Arc<Repository>,
        topic_id: &str,
        batch_period_sec: u64,
        config: Arc<Config>,
    ) -> Result<Arc<Self>, ConsumerError> {
        let core = BatchConsumerCore::new(
            repository,
            topic_id,
            batch_period_sec,
            BusMode::Retry,
            config,
        )
        .await?;
        // Paused from birth; the scheduler resumes it per run.
        core.pause();
        Ok(Arc::new(Self { core }))
    }

    async fn process_retry_batch(&self, retry_batch_size: usize) -> BatchResult {
        let core = &self.core;
        let config = core.config().clone();
        let consumer = core.consumer();
        let topic_id = core.topic_id().to_string();

        let mut counters = BatchCounters::default();
        let mut next_batch = true;

        // The retry topic has exactly one partition (checked at construction);
        // the high watermark bounds this run so we never chase our own
        // requeued messages.
        let high_watermark = match consumer.fetch_watermarks(&topic_id, 0, SEEK_TIMEOUT) {
            Ok((_low, high)) => Some(high),
            Err(err) => {
                warn!(topic = %topic_id, "Failed to query watermark offsets: {err}");
                None
            }
        };

        let mut messages: Vec<OwnedMessage> = Vec::new();
        let mut slept_on_error = false;
        while messages.len() < retry_batch_size {
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
            match read_message(&consumer, core.wait_for_messages()).await {
                Ok(Some(message)) => {
                    counters.consumed += 1;
                    messages.push(message);
                }
                Ok(None) => {
                    // Wait window is over; consider the batch full.
                    next_batch = false;
                    break;
                }
                Err(err) if is_retriable(&err) && !slept_on_error => {
                    slept_on_error = true;
                    sleep(core.wait_for_messages() * 10).await;
                }
                Err(err) => {
                    let error = ConsumerError::Internal(format!(
                        "Failed to consume event from topic. Retriable: {}: {err}",
                        is_retriable(&err)
                    ));
                    return self.fail_batch(
                        &consumer,
                        messages.first().map(|m| m.offset()),
                        None,
                        counters,
                        error,
                    );
                }
            }
        }

        if messages.is_empty() {
            return BatchResult {
                counters,
                next_batch,
                error: None,
            };
        }
        let first_offset = messages.first().map(|m| m.offset());
        let last_offset = messages.last().map(|m| m.offset()).unwrap_or(0);

        let dead_topic = TopicId::dead_for(&core.topic().destination_id).to_string();
        let now = Utc::now();
        let mut producer = core.producer.lock().await;
        let tx = match producer.begin() {
            Ok(tx) => tx,
            Err(err) => {
                return self.fail_batch(&consumer, first_offset, None, counters, err.into())
            }
        };

        for message in &messages {
            let message_id = get_header(message, MESSAGE_ID_HEADER).unwrap_or_default().to_string();
            let (target, headers) = match classify(message, now, config.messages_retry_count) {
                RetryDisposition::Skip(reason) => {
                    counters.skipped += 1;
                    error!(topic = %topic_id, offset = message.offset(), "{reason}. Skipping message");
                    continue;
                }
                RetryDisposition::DeadLetter {
                    original_topic,
                    retries,
                } => {
                    counters.dead_lettered += 1;
                    (
                        dead_topic.clone(),
                        build_retry_headers(&original_topic, retries, None, Some(&message_id)),
                    )
                }
                RetryDisposition::Requeue {
                    original_topic,
                    retries,
                    retry_time,
                } => {
                    counters.not_ready_readded += 1;
                    (
                        topic_id.clone(),
                        build_retry_headers(
                            &original_topic,
                            retries,
                            Some(&retry_time),
                            Some(&message_id),
                        ),
                    )
                }
                RetryDisposition::Retry {
                    original_topic,
                    retries,
                } => {
                    counters.retry_scheduled += 1;
                    (
                        original_topic.clone(),
                        build_retry_headers(&original_topic, retries, None, Some(&message_id)),
                    )
                }
            };
            if let Err(err) = tx.send(
                &target,
                message.key(),
                message.payload().unwrap_or(&[]),
                headers,
                &message_id,
            ) {
                return self.fail_batch(&consumer, first_offset, Some(tx), counters, err.into());
            }
        }

        // Advance the group past everything reclassified, atomically with the
        // produced messages.
        let Some(metadata) = consumer.group_metadata() else {
            return self.fail_batch(
                &consumer,
                first_offset,
                Some(tx),
                counters,
                ConsumerError::Internal("failed to get consumer group metadata".to_string()),
            );
        };
        let mut offsets = TopicPartitionList::new();
        if let Err(err) = offsets.add_partition_offset(&topic_id, 0, Offset::Offset(last_offset + 1))
        {
            return self.fail_batch(&consumer, first_offset, Some(tx), counters, err.into());
        }
        if let Err(err) = tx.associate_offsets(&offsets, &metadata) {
            return self.fail_batch(&consumer, first_offset, Some(tx), counters, err.into());
        }
        if let Err(err) = tx.commit() {
            // The transaction cannot be aborted after a failed commit; the
            // broker fences it. Rewind so the next run re-reads the batch.
            return self.fail_batch(&consumer, first_offset, None, counters, err.into());
        }

        BatchResult {
            counters,
            next_batch,
            error: None,
        }
    }

    fn fail_batch(
        &self,
        consumer: &StreamConsumer<PausingConsumerContext>,
        first_offset: Option<i64>,
        tx: Option<KafkaTransaction<'_>>,
        counters: BatchCounters,
        error: ConsumerError,
    ) -> BatchResult {
        self.core
            .rewind_and_abort(consumer, first_offset, tx, counters, error)
    }
}

#[async_trait]
impl BatchFunction for RetryConsumer {
    async fn process_batch(
        &self,
        _destination: &Arc<Destination>,
        _batch_number: u64,
        _batch_size: usize,
        retry_batch_size: usize,
    ) -> BatchResult {
        self.process_retry_batch(retry_batch_size).await
    }
}

#[async_trait]
impl BatchConsumer for RetryConsumer {
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use common_kafka::headers::format_retry_time;
    use rdkafka::message::{Header, OwnedHeaders, OwnedMessage};
    use rdkafka::Timestamp;

    const MAX_RETRIES: i32 = 5;
    const ORIGINAL: &str = "in.id.d1.m.stream.t.events";

    fn retry_message(headers: OwnedHeaders) -> OwnedMessage {
        OwnedMessage::new(
            Some(br#"{"id":"e1"}"#.to_vec()),
            None,
            "in.id.d1.m.retry.t._all_".to_string(),
            Timestamp::NotAvailable,
            0,
            0,
            Some(headers),
        )
    }

    fn envelope(retries: i32, retry_time: Option<&str>) -> OwnedHeaders {
        build_retry_headers(ORIGINAL, retries, retry_time, None)
    }

    #[test]
    fn missing_original_topic_is_skipped() {
        let message = retry_message(OwnedHeaders::new());
        assert!(matches!(
            classify(&message, Utc::now(), MAX_RETRIES),
            RetryDisposition::Skip(_)
        ));
    }

    #[test]
    fn malformed_retries_header_is_skipped() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: ORIGINAL_TOPIC_HEADER,
                value: Some(ORIGINAL),
            })
            .insert(Header {
                key: "retries",
                value: Some("a lot"),
            });
        assert!(matches!(
            classify(&retry_message(headers), Utc::now(), MAX_RETRIES),
            RetryDisposition::Skip(_)
        ));
    }

    #[test]
    fn exhausted_retries_go_to_the_dead_letter_topic() {
        let message = retry_message(envelope(MAX_RETRIES, None));
        assert_eq!(
            classify(&message, Utc::now(), MAX_RETRIES),
            RetryDisposition::DeadLetter {
                original_topic: ORIGINAL.to_string(),
                retries: MAX_RETRIES,
            }
        );
    }

    #[test]
    fn due_messages_are_retried_with_incremented_count() {
        let now = Utc::now();
        // Unset deadline.
        let message = retry_message(envelope(2, None));
        assert_eq!(
            classify(&message, now, MAX_RETRIES),
            RetryDisposition::Retry {
                original_topic: ORIGINAL.to_string(),
                retries: 3,
            }
        );

        // Past deadline.
        let past = format_retry_time(now - ChronoDuration::minutes(1));
        let message = retry_message(envelope(2, Some(&past)));
        assert!(matches!(
            classify(&message, now, MAX_RETRIES),
            RetryDisposition::Retry { retries: 3, .. }
        ));

        // Unparseable deadline is treated as due.
        let message = retry_message(envelope(0, Some("soon")));
        assert!(matches!(
            classify(&message, now, MAX_RETRIES),
            RetryDisposition::Retry { retries: 1, .. }
        ));
    }

    #[test]
    fn future_deadline_requeues_and_preserves_it_verbatim() {
        let now = Utc::now();
        let deadline = format_retry_time(now + ChronoDuration::minutes(5));
        let message = retry_message(envelope(2, Some(&deadline)));
        assert_eq!(
            classify(&message, now, MAX_RETRIES),
            RetryDisposition::Requeue {
                original_topic: ORIGINAL.to_string(),
                retries: 2,
                retry_time: deadline,
            }
        );
    }
}
