use std::sync::Arc;
use std::time::Duration;

use common_kafka::errors::{is_retriable, kafka_error_code, read_message};
use common_kafka::headers::{
    build_retry_headers, format_retry_time, get_header, retries_count, MESSAGE_ID_HEADER,
    RETRIES_COUNT_HEADER,
};
use common_kafka::produce_sync;
use rdkafka::consumer::Consumer;
use rdkafka::consumer::StreamConsumer as RdStreamConsumer;
use rdkafka::message::OwnedMessage;
use rdkafka::producer::FutureProducer;
use rdkafka::{ClientConfig, Message};
use sink_core::topic::TopicId;
use sink_core::{decode_event, BulkMode, SinkStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backoff::next_retry_time;
use crate::config::Config;
use crate::destination::Destination;
use crate::errors::ConsumerError;
use crate::events_log::{post_events_log, EventsLogService};
use crate::metrics;
use crate::tasks::spawn_with_restart;

const MESSAGE_WAIT_TIMEOUT: Duration = Duration::from_secs(1);
const RESTART_RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Single-owner slot for the live sink stream and its destination lease.
/// Swaps happen only at the message-loop boundary, so the previous sink gets
/// exactly one `complete` and never sees another `consume`.
pub(crate) struct SinkSlot {
    pub(crate) destination: Arc<Destination>,
    pub(crate) stream: Box<dyn SinkStream>,
}

pub(crate) struct SinkUpdate {
    pub(crate) destination: Arc<Destination>,
    pub(crate) stream: Box<dyn SinkStream>,
    pub(crate) ack: oneshot::Sender<()>,
}

impl SinkSlot {
    pub(crate) async fn swap(&mut self, update: SinkUpdate) {
        let old_stream = std::mem::replace(&mut self.stream, update.stream);
        match old_stream.complete().await {
            Ok(state) => info!("Previous stream state: {state:?}"),
            Err(err) => error!("Failed to complete previous stream: {err}"),
        }
        let old_destination = std::mem::replace(&mut self.destination, update.destination);
        old_destination.release();
        let _ = update.ack.send(());
    }

    /// Final handoff: completes the sink, or aborts it if the last message
    /// failed, then drops the destination lease.
    pub(crate) async fn close(self, failed: bool) {
        let state = if failed {
            self.stream.abort().await
        } else {
            self.stream.complete().await
        };
        match state {
            Ok(state) => info!("Closed stream state: {state:?}"),
            Err(err) => warn!("Failed to close sink stream: {err}"),
        }
        self.destination.release();
    }
}

struct Shared {
    config: Arc<Config>,
    events_log: Arc<dyn EventsLogService>,
    producer: FutureProducer,
    consumer_config: ClientConfig,
    topic_id: String,
    destination_id: String,
    table_name: String,
    state: Mutex<LoopState>,
    update_tx: mpsc::Sender<SinkUpdate>,
    close_tx: watch::Sender<bool>,
}

struct LoopState {
    consumer: RdStreamConsumer,
    slot: Option<SinkSlot>,
    update_rx: mpsc::Receiver<SinkUpdate>,
    close_rx: watch::Receiver<bool>,
    // Whether the most recent message failed; decides complete vs abort on
    // shutdown.
    failed: bool,
}

impl Shared {
    fn message_metric(&self, status: &str, count: u64) {
        metrics::consumer_messages(
            &self.topic_id,
            "stream",
            &self.destination_id,
            &self.table_name,
            status,
            count,
        );
    }

    fn error_metric(&self, error_type: &str) {
        metrics::consumer_errors(
            &self.topic_id,
            "stream",
            &self.destination_id,
            &self.table_name,
            error_type,
        );
    }
}

/// Long-running per-topic loop feeding messages one at a time into the
/// current sink stream, with in-flight hot swap of the destination.
pub struct StreamConsumer {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl StreamConsumer {
    pub async fn new(
        destination: Arc<Destination>,
        topic_id: &str,
        config: Arc<Config>,
        producer: FutureProducer,
        events_log: Arc<dyn EventsLogService>,
    ) -> Result<Arc<Self>, ConsumerError> {
        let topic = TopicId::parse(topic_id).map_err(|err| {
            metrics::consumer_errors(
                topic_id,
                "stream",
                "INVALID_TOPIC",
                &format!("INVALID_TOPIC:{topic_id}"),
                "failed to parse topic",
            );
            err
        })?;

        let consumer_config =
            config
                .kafka
                .consumer_client_config(topic_id, config.instance_id(), true, None);
        let consumer: RdStreamConsumer = consumer_config.create().map_err(|err| {
            metrics::consumer_errors(
                topic_id,
                "stream",
                destination.id(),
                &topic.table_name,
                &kafka_error_code(&err),
            );
            err
        })?;
        consumer.subscribe(&[topic_id]).map_err(|err| {
            metrics::consumer_errors(
                topic_id,
                "stream",
                destination.id(),
                &topic.table_name,
                &kafka_error_code(&err),
            );
            err
        })?;

        destination.lease();
        let stream = match destination
            .create_stream(topic_id, &topic.table_name, BulkMode::Stream)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                metrics::consumer_errors(
                    topic_id,
                    "stream",
                    destination.id(),
                    &topic.table_name,
                    "failed to create sink stream",
                );
                destination.release();
                return Err(err.into());
            }
        };

        let (update_tx, update_rx) = mpsc::channel(1);
        let (close_tx, close_rx) = watch::channel(false);
        info!(
            topic = topic_id,
            "Starting stream consumer for topic. Ver: {}",
            destination.updated_at()
        );
        let shared = Arc::new(Shared {
            config,
            events_log,
            producer,
            consumer_config,
            topic_id: topic_id.to_string(),
            destination_id: topic.destination_id.clone(),
            table_name: topic.table_name.clone(),
            state: Mutex::new(LoopState {
                consumer,
                slot: Some(SinkSlot {
                    destination,
                    stream,
                }),
                update_rx,
                close_rx,
                failed: false,
            }),
            update_tx,
            close_tx,
        });

        let run_shared = shared.clone();
        let handle = spawn_with_restart("stream-consumer", move || {
            let shared = run_shared.clone();
            async move { run_loop(shared).await }
        });

        Ok(Arc::new(Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }))
    }

    pub fn topic_id(&self) -> &str {
        &self.shared.topic_id
    }

    /// Hot-swaps the destination: leases the new version, builds its sink
    /// stream, and hands both to the message loop, which applies the swap at
    /// its next iteration without dropping an in-flight read. Waits for the
    /// loop to acknowledge the handoff.
    pub async fn update_destination(
        &self,
        destination: Arc<Destination>,
    ) -> Result<(), ConsumerError> {
        info!(
            topic = %self.shared.topic_id,
            "Updating stream consumer for topic. Ver: {}",
            destination.updated_at()
        );
        destination.lease();
        let stream = match destination
            .create_stream(&self.shared.topic_id, &self.shared.table_name, BulkMode::Stream)
            .await
        {
            Ok(stream) => stream,
            Err(err) => {
                destination.release();
                return Err(err.into());
            }
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if let Err(mpsc::error::SendError(update)) = self
            .shared
            .update_tx
            .send(SinkUpdate {
                destination,
                stream,
                ack: ack_tx,
            })
            .await
        {
            update.destination.release();
            return Err(ConsumerError::Internal(
                "stream consumer is closed".to_string(),
            ));
        }
        ack_rx.await.map_err(|_| {
            ConsumerError::Internal("stream consumer closed during update".to_string())
        })
    }

    /// Signals shutdown and waits for the loop to drain its current message
    /// and hand the sink its final `complete`/`abort`.
    pub async fn close(&self) {
        info!(topic = %self.shared.topic_id, "Closing stream consumer");
        let _ = self.shared.close_tx.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn run_loop(shared: Arc<Shared>) {
    let mut guard = shared.state.lock().await;
    let state = &mut *guard;
    loop {
        // Pending hot swaps apply here, never mid-message.
        while let Ok(update) = state.update_rx.try_recv() {
            if let Some(slot) = state.slot.as_mut() {
                slot.swap(update).await;
                state.failed = false;
            }
        }
        if *state.close_rx.borrow() {
            if let Some(slot) = state.slot.take() {
                slot.close(state.failed).await;
            }
            return;
        }
        let message = match read_message(&state.consumer, MESSAGE_WAIT_TIMEOUT).await {
            Ok(None) => continue,
            Ok(Some(message)) => message,
            Err(err) => {
                shared.error_metric(&kafka_error_code(&err));
                error!(
                    topic = %shared.topic_id,
                    "Error reading message from topic: {err} retriable: {}",
                    is_retriable(&err)
                );
                if is_retriable(&err) {
                    tokio::time::sleep(MESSAGE_WAIT_TIMEOUT * 10).await;
                } else {
                    restart_consumer(&shared, state).await;
                }
                continue;
            }
        };
        process_message(&shared, state, &message).await;
    }
}

async fn process_message(shared: &Arc<Shared>, state: &mut LoopState, message: &OwnedMessage) {
    shared.message_metric("consumed", 1);
    let payload = message.payload().unwrap_or(&[]);
    let Some(slot) = state.slot.as_mut() else {
        return;
    };

    let mut failure: Option<String> = None;
    match decode_event(payload) {
        Err(err) => {
            shared.error_metric("parse_event_error");
            post_events_log(
                shared.events_log.as_ref(),
                &shared.destination_id,
                payload,
                None,
                &[],
                Some(&err.to_string()),
            )
            .await;
            error!(
                topic = %shared.topic_id,
                offset = message.offset(),
                "Failed to parse event from message: {err}"
            );
            failure = Some(err.to_string());
        }
        Ok(object) => {
            debug!(
                topic = %shared.topic_id,
                offset = message.offset(),
                retries = get_header(message, RETRIES_COUNT_HEADER).unwrap_or(""),
                "Consumed message"
            );
            match slot.stream.consume(object).await {
                Ok(outcome) => {
                    post_events_log(
                        shared.events_log.as_ref(),
                        &shared.destination_id,
                        payload,
                        outcome.state.representation.as_ref(),
                        &outcome.processed,
                        None,
                    )
                    .await;
                    shared.message_metric("processed", 1);
                }
                Err(err) => {
                    shared.error_metric("sink_stream_error");
                    post_events_log(
                        shared.events_log.as_ref(),
                        &shared.destination_id,
                        payload,
                        None,
                        &[],
                        Some(&err.to_string()),
                    )
                    .await;
                    error!(
                        topic = %shared.topic_id,
                        "Failed to inject event to sink stream: {err}"
                    );
                    failure = Some(err.to_string());
                }
            }
        }
    }

    state.failed = failure.is_some();
    if failure.is_some() {
        schedule_retry(shared, message).await;
    }
}

/// Failure path: the original payload goes to the destination's retry topic
/// (dead-letter once attempts are exhausted) with an updated envelope. A
/// failed produce counts the event as LOST and the loop moves on.
async fn schedule_retry(shared: &Arc<Shared>, message: &OwnedMessage) {
    let retries = retries_count(message).unwrap_or_else(|err| {
        error!(topic = %shared.topic_id, "failed to read retry header: {err}");
        0
    });
    let (failed_topic, status) = if retries >= shared.config.messages_retry_count {
        // No attempts left; park on the dead-letter topic.
        (
            TopicId::dead_for(&shared.destination_id).to_string(),
            "deadLettered",
        )
    } else {
        (
            TopicId::retry_for(&shared.destination_id).to_string(),
            "retryScheduled",
        )
    };
    let deadline = format_retry_time(next_retry_time(&shared.config, retries + 1));
    let message_id = get_header(message, MESSAGE_ID_HEADER).unwrap_or_default();
    let headers = build_retry_headers(
        &shared.topic_id,
        retries,
        Some(&deadline),
        Some(message_id),
    );
    match produce_sync(
        &shared.producer,
        &failed_topic,
        message.key(),
        message.payload().unwrap_or(&[]),
        headers,
    )
    .await
    {
        Err(err) => {
            error!(
                topic = %shared.topic_id,
                "failed to store event to 'failed' topic: {failed_topic}: {err}"
            );
            shared.message_metric("LOST", 1);
        }
        Ok(()) => {
            shared.message_metric("failed", 1);
            shared.message_metric(status, 1);
        }
    }
}

async fn restart_consumer(shared: &Arc<Shared>, state: &mut LoopState) {
    info!(topic = %shared.topic_id, "Restarting consumer");
    let mut waited = Duration::ZERO;
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if *state.close_rx.borrow() {
            return;
        }
        waited += Duration::from_secs(1);
        if waited < RESTART_RETRY_INTERVAL {
            continue;
        }
        waited = Duration::ZERO;
        let created: Result<RdStreamConsumer, _> = shared.consumer_config.create();
        match created.and_then(|consumer| {
            consumer.subscribe(&[shared.topic_id.as_str()]).map(|_| consumer)
        }) {
            Ok(consumer) => {
                state.consumer = consumer;
                info!(topic = %shared.topic_id, "Restarted successfully");
                return;
            }
            Err(err) => {
                shared.error_metric(&kafka_error_code(&err));
                error!(topic = %shared.topic_id, "Error creating kafka consumer: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{destination_with_factory, RecordingSinkFactory};
    use serde_json::json;
    use sink_core::decode_event;
    use std::sync::atomic::Ordering;

    async fn slot_for(factory: &Arc<RecordingSinkFactory>) -> SinkSlot {
        let destination = destination_with_factory("d1", json!({"mode": "stream"}), factory.clone());
        destination.lease();
        let stream = destination
            .create_stream("in.id.d1.m.stream.t.events", "events", BulkMode::Stream)
            .await
            .unwrap();
        SinkSlot {
            destination,
            stream,
        }
    }

    #[tokio::test]
    async fn swap_completes_old_sink_exactly_once_and_redirects_consumes() {
        let factory = Arc::new(RecordingSinkFactory::default());
        let mut slot = slot_for(&factory).await;
        slot.stream
            .consume(decode_event(br#"{"id":"e1"}"#).unwrap())
            .await
            .unwrap();

        let new_destination =
            destination_with_factory("d1", json!({"mode": "stream"}), factory.clone());
        new_destination.lease();
        let new_stream = new_destination
            .create_stream("in.id.d1.m.stream.t.events", "events", BulkMode::Stream)
            .await
            .unwrap();
        let old_destination = slot.destination.clone();
        let (ack_tx, ack_rx) = oneshot::channel();
        slot.swap(SinkUpdate {
            destination: new_destination,
            stream: new_stream,
            ack: ack_tx,
        })
        .await;
        ack_rx.await.unwrap();

        slot.stream
            .consume(decode_event(br#"{"id":"e2"}"#).unwrap())
            .await
            .unwrap();
        slot.stream
            .consume(decode_event(br#"{"id":"e3"}"#).unwrap())
            .await
            .unwrap();

        let streams = factory.streams();
        assert_eq!(streams.len(), 2);
        let (old, new) = (&streams[0], &streams[1]);
        // Exactly one complete on the old sink, no consumes after the swap.
        assert_eq!(old.completes.load(Ordering::SeqCst), 1);
        assert_eq!(old.aborts.load(Ordering::SeqCst), 0);
        assert_eq!(old.consumed.lock().unwrap().len(), 1);
        // Every post-swap consume landed on the new sink.
        assert_eq!(new.consumed.lock().unwrap().len(), 2);
        assert_eq!(new.completes.load(Ordering::SeqCst), 0);
        // The old destination lease was dropped.
        assert_eq!(old_destination.lease_count(), 0);
    }

    #[tokio::test]
    async fn close_aborts_when_the_last_message_failed() {
        let factory = Arc::new(RecordingSinkFactory::default());
        let slot = slot_for(&factory).await;
        slot.close(true).await;

        let streams = factory.streams();
        assert_eq!(streams[0].aborts.load(Ordering::SeqCst), 1);
        assert_eq!(streams[0].completes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn close_completes_on_success() {
        let factory = Arc::new(RecordingSinkFactory::default());
        let slot = slot_for(&factory).await;
        let destination = slot.destination.clone();
        slot.close(false).await;

        let streams = factory.streams();
        assert_eq!(streams[0].completes.load(Ordering::SeqCst), 1);
        assert_eq!(destination.lease_count(), 0);
    }
}
