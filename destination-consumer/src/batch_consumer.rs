use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use common_kafka::errors::{is_retriable, kafka_error_code, read_message};
use common_kafka::transaction::{KafkaTransaction, TransactionalProducer};
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, ClientContext, Message, Offset, TopicPartitionList};
use sink_core::topic::{BusMode, TopicError, TopicId};
use sink_core::{BATCH_SIZE_OPTION, RETRY_BATCH_SIZE_OPTION};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::destination::{Destination, Repository};
use crate::errors::ConsumerError;
use crate::metrics;
use crate::tasks::spawn_with_restart;

pub const PAUSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const RESTART_RETRY_INTERVAL: Duration = Duration::from_secs(10);
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const SEEK_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-run counters. Monotonic, non-negative; accumulated across batches and
/// emitted as metrics once per run. Label names match the metric values.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchCounters {
    pub consumed: u64,
    pub skipped: u64,
    pub processed: u64,
    pub not_ready_readded: u64,
    pub retry_scheduled: u64,
    pub dead_lettered: u64,
    pub failed: u64,
}

impl BatchCounters {
    pub fn accumulate(&mut self, other: BatchCounters) {
        self.consumed += other.consumed;
        self.skipped += other.skipped;
        self.processed += other.processed;
        self.not_ready_readded += other.not_ready_readded;
        self.retry_scheduled += other.retry_scheduled;
        self.dead_lettered += other.dead_lettered;
        self.failed += other.failed;
    }

    pub fn fields(&self) -> [(&'static str, u64); 7] {
        [
            ("consumed", self.consumed),
            ("skipped", self.skipped),
            ("processed", self.processed),
            ("notReadyReadded", self.not_ready_readded),
            ("retryScheduled", self.retry_scheduled),
            ("deadLettered", self.dead_lettered),
            ("failed", self.failed),
        ]
    }
}

impl fmt::Display for BatchCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.fields() {
            if value > 0 {
                write!(f, "{name}: {value} ")?;
            }
        }
        Ok(())
    }
}

/// Outcome of one batch. `next_batch` asks the run loop to go again; an
/// error with `next_batch = true` is logged and the run continues.
pub struct BatchResult {
    pub counters: BatchCounters,
    pub next_batch: bool,
    pub error: Option<ConsumerError>,
}

/// One batch of work against a leased destination. Implemented by the retry
/// consumer and the table batch consumer.
#[async_trait]
pub trait BatchFunction: Send + Sync {
    async fn process_batch(
        &self,
        destination: &Arc<Destination>,
        batch_number: u64,
        batch_size: usize,
        retry_batch_size: usize,
    ) -> BatchResult;
}

/// Public surface of a periodic batch consumer, driven by the scheduler.
#[async_trait]
pub trait BatchConsumer: Send + Sync {
    async fn run_job(&self);
    async fn consume_all(&self) -> Result<BatchCounters, ConsumerError>;
    fn retire(&self);
    fn is_retired(&self) -> bool;
    fn batch_period_sec(&self) -> u64;
    fn update_batch_period(&self, batch_period_sec: u64);
    fn topic_id(&self) -> &str;
}

/// Consumer context that re-pauses partitions handed to us by a rebalance
/// while the consumer is logically paused; without this, a rebalance would
/// silently resume consumption between batches.
pub struct PausingConsumerContext {
    topic_id: String,
    mode: BusMode,
    destination_id: String,
    table_name: String,
    paused: Arc<AtomicBool>,
}

impl ClientContext for PausingConsumerContext {}

impl ConsumerContext for PausingConsumerContext {
    fn post_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        debug!(
            topic = %self.topic_id,
            "Rebalance event: {rebalance:?}. Paused: {}",
            self.paused.load(Ordering::SeqCst)
        );
        if let Rebalance::Assign(partitions) = rebalance {
            if partitions.count() > 0 && self.paused.load(Ordering::SeqCst) {
                if let Err(err) = consumer.pause(partitions) {
                    metrics::consumer_errors(
                        &self.topic_id,
                        self.mode.as_str(),
                        &self.destination_id,
                        &self.table_name,
                        "pause_error",
                    );
                    error!(topic = %self.topic_id, "Failed to pause kafka consumer: {err}");
                } else {
                    debug!(topic = %self.topic_id, "Consumer paused.");
                }
            }
        }
    }
}

/// State and machinery shared by all batch consumers: the bus consumer, the
/// transactional producer, the `{retired, idle, paused}` state machine, the
/// pause-heartbeat loop, and the `ConsumeAll` run loop.
pub struct BatchConsumerCore {
    config: Arc<Config>,
    repository: Arc<Repository>,
    topic: TopicId,
    topic_id: String,
    batch_period_sec: AtomicU64,
    consumer_config: ClientConfig,
    consumer: RwLock<Arc<StreamConsumer<PausingConsumerContext>>>,
    pub(crate) producer: Mutex<TransactionalProducer>,
    wait_for_messages: Duration,
    // Serializes all batch work; `consume_all` is not re-entrant.
    run_lock: Arc<Mutex<()>>,

    // Marked as no longer needed; cannot close immediately because a batch
    // may be in progress.
    retired: AtomicBool,
    // Not running any batch job. A retired idle consumer closes itself.
    idle: AtomicBool,
    // Guards bus consumption between (and during) batches.
    paused: Arc<AtomicBool>,
    closed: AtomicBool,
    resume_tx: mpsc::Sender<oneshot::Sender<()>>,
    resume_rx: Mutex<mpsc::Receiver<oneshot::Sender<()>>>,
}

impl BatchConsumerCore {
    pub async fn new(
        repository: Arc<Repository>,
        topic_id: &str,
        batch_period_sec: u64,
        expected_mode: BusMode,
        config: Arc<Config>,
    ) -> Result<Arc<Self>, ConsumerError> {
        let topic = TopicId::parse(topic_id).map_err(|err| {
            metrics::consumer_errors(
                topic_id,
                expected_mode.as_str(),
                "INVALID_TOPIC",
                "INVALID_TOPIC",
                "failed to parse topic",
            );
            err
        })?;
        if topic.mode != expected_mode {
            metrics::consumer_errors(
                topic_id,
                expected_mode.as_str(),
                &topic.destination_id,
                &topic.table_name,
                "failed to parse topic",
            );
            return Err(TopicError::InvalidTopicId(topic_id.to_string()).into());
        }

        let consumer_config = config.kafka.consumer_client_config(
            topic_id,
            config.instance_id(),
            false,
            config.session_timeout_override_ms(),
        );
        let paused = Arc::new(AtomicBool::new(false));
        let consumer = Self::create_consumer_with(&consumer_config, &topic, topic_id, &paused)
            .map_err(|err| {
                Self::construction_error(&topic, topic_id, &err);
                err
            })?;

        // Batch consumers rely on the bus-provided total order of a single
        // partition; refuse anything else.
        let metadata = consumer
            .fetch_metadata(Some(topic_id), METADATA_TIMEOUT)
            .map_err(|err| {
                Self::construction_error(&topic, topic_id, &err);
                err
            })?;
        if let Some(meta_topic) = metadata.topics().iter().find(|t| t.name() == topic_id) {
            let count = meta_topic.partitions().len();
            if count > 1 {
                metrics::consumer_errors(
                    topic_id,
                    topic.mode.as_str(),
                    &topic.destination_id,
                    &topic.table_name,
                    "invalid_partitions_count",
                );
                return Err(ConsumerError::InvalidPartitionCount {
                    topic: topic_id.to_string(),
                    count,
                });
            }
        }

        let transactional_id = format!("{topic_id}_failed_{}", config.instance_id());
        let (producer, delivery_reports) = TransactionalProducer::new(
            &config.kafka,
            &transactional_id,
            Duration::from_secs(10),
        )
        .map_err(|err| {
            Self::construction_error(&topic, topic_id, &err);
            err
        })?;
        // Delivery reports for retry/dead-letter writes are only logged;
        // failures surface at transaction commit.
        tokio::spawn(delivery_reports.drain());

        consumer.subscribe(&[topic_id]).map_err(|err| {
            Self::construction_error(&topic, topic_id, &err);
            err
        })?;

        let (resume_tx, resume_rx) = mpsc::channel(1);
        let config_wait = config.wait_for_messages();
        Ok(Arc::new(Self {
            config,
            repository,
            topic,
            topic_id: topic_id.to_string(),
            batch_period_sec: AtomicU64::new(batch_period_sec),
            consumer_config,
            consumer: RwLock::new(Arc::new(consumer)),
            producer: Mutex::new(producer),
            wait_for_messages: config_wait,
            run_lock: Arc::new(Mutex::new(())),
            retired: AtomicBool::new(false),
            idle: AtomicBool::new(true),
            paused,
            closed: AtomicBool::new(false),
            resume_tx,
            resume_rx: Mutex::new(resume_rx),
        }))
    }

    fn construction_error(topic: &TopicId, topic_id: &str, err: &KafkaError) {
        metrics::consumer_errors(
            topic_id,
            topic.mode.as_str(),
            &topic.destination_id,
            &topic.table_name,
            &kafka_error_code(err),
        );
    }

    fn create_consumer_with(
        consumer_config: &ClientConfig,
        topic: &TopicId,
        topic_id: &str,
        paused: &Arc<AtomicBool>,
    ) -> Result<StreamConsumer<PausingConsumerContext>, KafkaError> {
        let context = PausingConsumerContext {
            topic_id: topic_id.to_string(),
            mode: topic.mode,
            destination_id: topic.destination_id.clone(),
            table_name: topic.table_name.clone(),
            paused: paused.clone(),
        };
        consumer_config.create_with_context(context)
    }

    pub fn topic_id(&self) -> &str {
        &self.topic_id
    }

    pub fn topic(&self) -> &TopicId {
        &self.topic
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn wait_for_messages(&self) -> Duration {
        self.wait_for_messages
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    pub fn batch_period_sec(&self) -> u64 {
        self.batch_period_sec.load(Ordering::SeqCst)
    }

    pub fn update_batch_period(&self, batch_period_sec: u64) {
        self.batch_period_sec
            .store(batch_period_sec, Ordering::SeqCst);
    }

    /// Current bus consumer handle; swapped by the restart path.
    pub fn consumer(&self) -> Arc<StreamConsumer<PausingConsumerContext>> {
        self.consumer.read().unwrap().clone()
    }

    pub fn retire(&self) {
        info!(topic = %self.topic_id, "Retiring {} consumer", self.topic.mode);
        self.retired.store(true, Ordering::SeqCst);
    }

    pub(crate) fn error_metric(&self, error_type: &str) {
        metrics::consumer_errors(
            &self.topic_id,
            self.topic.mode.as_str(),
            &self.topic.destination_id,
            &self.topic.table_name,
            error_type,
        );
    }

    fn runs_metric(&self, result: &str) {
        metrics::consumer_runs(
            &self.topic_id,
            self.topic.mode.as_str(),
            &self.topic.destination_id,
            &self.topic.table_name,
            result,
        );
    }

    fn counters_metric(&self, counters: &BatchCounters) {
        for (name, value) in counters.fields() {
            if value > 0 {
                metrics::consumer_messages(
                    &self.topic_id,
                    self.topic.mode.as_str(),
                    &self.topic.destination_id,
                    &self.topic.table_name,
                    name,
                    value,
                );
            }
        }
    }

    /// Runs batches until the batch function reports no more work or the
    /// consumer is retired. Serialized: not re-entrant.
    pub async fn consume_all(
        self: &Arc<Self>,
        batch_fn: &dyn BatchFunction,
    ) -> Result<BatchCounters, ConsumerError> {
        // Serialize all batch work; a second scheduler tick waits here.
        let _guard = self.run_lock.clone().lock_owned().await;
        if self.is_retired() {
            error!(topic = %self.topic_id, "No messages were consumed. Consumer is retired.");
            return Err(ConsumerError::Retired);
        }
        debug!(topic = %self.topic_id, "Starting consuming messages from topic");
        self.idle.store(false, Ordering::SeqCst);

        let (counters, error) = self.run_batches(batch_fn).await;

        self.idle.store(true, Ordering::SeqCst);
        self.pause();
        self.counters_metric(&counters);
        match error {
            Some(err) => {
                self.runs_metric("fail");
                error!(
                    topic = %self.topic_id,
                    "Consume finished with error: {err} stats: {counters}"
                );
                Err(err)
            }
            None => {
                self.runs_metric("success");
                if counters.processed > 0 {
                    info!(topic = %self.topic_id, "Successfully {counters}");
                } else {
                    debug!(topic = %self.topic_id, "No messages were processed: {counters}");
                }
                Ok(counters)
            }
        }
    }

    async fn run_batches(
        self: &Arc<Self>,
        batch_fn: &dyn BatchFunction,
    ) -> (BatchCounters, Option<ConsumerError>) {
        let mut counters = BatchCounters::default();
        let Some(destination) = self.repository.lease_destination(&self.topic.destination_id)
        else {
            self.retire();
            return (
                counters,
                Some(ConsumerError::DestinationMissing(
                    self.topic.destination_id.clone(),
                )),
            );
        };

        let batch_size_option = BATCH_SIZE_OPTION.get(destination.stream_options()).max(0) as usize;
        let max_batch_size = batch_size_option.max(self.config.batch_runner_default_batch_size);
        let retry_batch_size_option =
            RETRY_BATCH_SIZE_OPTION.get(destination.stream_options()).max(0) as usize;
        let retry_batch_size = retry_batch_size_option.max(
            (max_batch_size as f64 * self.config.batch_runner_default_retry_batch_fraction)
                as usize,
        );

        let mut error = None;
        let mut batch_number = 1u64;
        loop {
            if self.is_retired() {
                break;
            }
            if let Err(err) = self.resume().await {
                error = Some(err);
                break;
            }
            let batch = batch_fn
                .process_batch(&destination, batch_number, max_batch_size, retry_batch_size)
                .await;
            counters.accumulate(batch.counters);
            if let (Some(err), true) = (&batch.error, batch.next_batch) {
                error!(
                    topic = %self.topic_id,
                    "Batch finished with error: {err} stats: {} nextBatch: true", batch.counters
                );
            }
            if !batch.next_batch {
                error = batch.error;
                break;
            }
            batch_number += 1;
        }

        destination.release();
        (counters, error)
    }

    /// Synchronous resume handshake: the pause loop must accept the token
    /// before partitions are resumed, otherwise the run fails fast.
    async fn resume(&self) -> Result<(), ConsumerError> {
        if !self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }
        let consumer = self.consumer();
        let partitions = consumer.assignment().map_err(|err| {
            self.error_metric("resume_error");
            error!(topic = %self.topic_id, "failed to resume kafka consumer: {err}");
            ConsumerError::Kafka(err)
        })?;

        let (ack_tx, ack_rx) = oneshot::channel();
        if self.resume_tx.send(ack_tx).await.is_err() {
            self.error_metric("resume_error");
            return Err(ConsumerError::Internal(
                "resume channel closed".to_string(),
            ));
        }
        match tokio::time::timeout(PAUSE_HEARTBEAT_INTERVAL * 3, ack_rx).await {
            Ok(Ok(())) => {
                consumer.resume(&partitions).map_err(|err| {
                    self.error_metric("resume_error");
                    error!(topic = %self.topic_id, "failed to resume kafka consumer: {err}");
                    ConsumerError::Kafka(err)
                })?;
                Ok(())
            }
            _ => {
                self.error_metric("resume_error");
                error!(topic = %self.topic_id, "failed to resume kafka consumer: resume timeout");
                Err(ConsumerError::ResumeTimeout)
            }
        }
    }

    /// Pauses bus consumption and starts the heartbeat loop. A retired idle
    /// consumer closes itself instead.
    pub fn pause(self: &Arc<Self>) {
        if self.idle.load(Ordering::SeqCst) && self.is_retired() {
            info!(topic = %self.topic_id, "Consumer is retired. Closing");
            self.close();
            return;
        }
        if self
            .paused
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        self.pause_partitions();

        let core = Arc::clone(self);
        spawn_with_restart("pause-heartbeat", move || {
            let core = core.clone();
            async move { core.pause_loop().await }
        });
    }

    fn pause_partitions(&self) {
        let consumer = self.consumer();
        match consumer.assignment() {
            Ok(partitions) => {
                if partitions.count() > 0 {
                    if let Err(err) = consumer.pause(&partitions) {
                        self.error_metric("pause_error");
                        error!(topic = %self.topic_id, "Failed to pause kafka consumer: {err}");
                    } else {
                        debug!(topic = %self.topic_id, "Consumer paused.");
                    }
                }
                // With no assignment yet, the rebalance callback pauses.
            }
            Err(err) => {
                self.error_metric("pause_error");
                error!(topic = %self.topic_id, "Failed to pause kafka consumer: {err}");
            }
        }
    }

    /// Keeps heartbeating the paused consumer so the group does not evict it.
    /// A message that slips through (partition paused late after a rebalance)
    /// is seeked back and the partitions re-paused.
    async fn pause_loop(self: Arc<Self>) {
        let mut error_reported = false;
        let mut receiver = self.resume_rx.lock().await;
        let mut ticker = tokio::time::interval_at(
            tokio::time::Instant::now() + PAUSE_HEARTBEAT_INTERVAL,
            PAUSE_HEARTBEAT_INTERVAL,
        );
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if self.idle.load(Ordering::SeqCst) && self.is_retired() {
                info!(topic = %self.topic_id, "Consumer is retired. Closing");
                self.close();
                return;
            }
            tokio::select! {
                ack = receiver.recv() => {
                    if let Some(ack) = ack {
                        self.paused.store(false, Ordering::SeqCst);
                        debug!(topic = %self.topic_id, "Consumer resumed.");
                        let _ = ack.send(());
                    }
                    return;
                }
                _ = ticker.tick() => {}
            }

            let consumer = self.consumer();
            match read_message(&consumer, self.wait_for_messages).await {
                Ok(None) => {
                    debug!(topic = %self.topic_id, "Consumer paused. Heartbeat sent.");
                }
                Ok(Some(message)) => {
                    debug!(
                        topic = %self.topic_id,
                        offset = message.offset(),
                        "Unexpected message on paused consumer"
                    );
                    let mut seek_back = TopicPartitionList::new();
                    let seek = match seek_back.add_partition_offset(
                        message.topic(),
                        message.partition(),
                        Offset::Offset(message.offset()),
                    ) {
                        Ok(()) => consumer
                            .seek_partitions(seek_back, SEEK_TIMEOUT)
                            .map(|_| ()),
                        Err(err) => Err(err),
                    };
                    if let Err(err) = seek {
                        self.error_metric("ROLLBACK_ON_PAUSE_ERR");
                        error!(
                            topic = %self.topic_id,
                            "Failed to rollback offset on paused consumer: {err}"
                        );
                    }
                    self.pause_partitions();
                }
                Err(err) => {
                    self.error_metric("error_while_paused");
                    if !error_reported {
                        error!(topic = %self.topic_id, "Error on paused consumer: {err}");
                        error_reported = true;
                    }
                    if is_retriable(&err) {
                        tokio::time::sleep(PAUSE_HEARTBEAT_INTERVAL).await;
                    } else {
                        self.restart_consumer().await;
                    }
                }
            }
        }
    }

    /// Replaces the bus consumer after a fatal error: the old handle is
    /// dropped, a new one subscribes to the same topic. Retired/paused state
    /// is untouched.
    pub(crate) async fn restart_consumer(self: &Arc<Self>) {
        if self.is_retired() {
            return;
        }
        info!(topic = %self.topic_id, "Restarting consumer");
        let mut attempt = tokio::time::interval_at(
            tokio::time::Instant::now() + RESTART_RETRY_INTERVAL,
            RESTART_RETRY_INTERVAL,
        );
        // For faster reaction on retiring.
        let mut retire_check = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = retire_check.tick() => {
                    if self.idle.load(Ordering::SeqCst) && self.is_retired() {
                        return;
                    }
                }
                _ = attempt.tick() => {
                    match Self::create_consumer_with(
                        &self.consumer_config,
                        &self.topic,
                        &self.topic_id,
                        &self.paused,
                    )
                    .and_then(|consumer| {
                        consumer.subscribe(&[self.topic_id.as_str()]).map(|_| consumer)
                    }) {
                        Ok(consumer) => {
                            *self.consumer.write().unwrap() = Arc::new(consumer);
                            info!(topic = %self.topic_id, "Restarted successfully");
                            return;
                        }
                        Err(err) => {
                            self.error_metric(&format!("consumer_error:{}", kafka_error_code(&err)));
                            error!(topic = %self.topic_id, "Error creating kafka consumer: {err}");
                        }
                    }
                }
            }
        }
    }

    fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        // Leave the group; the client handle itself is freed on drop.
        self.consumer().unsubscribe();
        info!(topic = %self.topic_id, "Consumer closed");
    }

    /// Failed-batch cleanup: rewind the consumer to the first consumed offset
    /// and abort any open transaction, so neither the offsets nor the
    /// produced messages survive.
    pub(crate) fn rewind_and_abort(
        &self,
        consumer: &StreamConsumer<PausingConsumerContext>,
        first_offset: Option<i64>,
        tx: Option<KafkaTransaction<'_>>,
        counters: BatchCounters,
        error: ConsumerError,
    ) -> BatchResult {
        if let Some(offset) = first_offset {
            let mut seek = TopicPartitionList::new();
            if seek
                .add_partition_offset(&self.topic_id, 0, Offset::Offset(offset))
                .is_ok()
            {
                if let Err(err) = consumer.seek_partitions(seek, SEEK_TIMEOUT) {
                    error!(
                        topic = %self.topic_id,
                        "Failed to seek back after failed batch: {err}"
                    );
                }
            }
        }
        if let Some(tx) = tx {
            if let Err(err) = tx.abort() {
                error!(topic = %self.topic_id, "Failed to abort transaction: {err}");
            }
        }
        BatchResult {
            counters,
            next_batch: false,
            error: Some(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_config;

    #[tokio::test]
    async fn multi_partition_topics_are_rejected() {
        let (cluster, kafka) = common_kafka::test::create_mock_kafka();
        let topic = "in.id.d9.m.retry.t._all_";
        cluster
            .create_topic(topic, 2, 1)
            .expect("failed to create topic");

        let mut config = test_config();
        config.kafka = kafka;
        let repository = Arc::new(Repository::new());
        let err = BatchConsumerCore::new(repository, topic, 300, BusMode::Retry, Arc::new(config))
            .await
            .err()
            .expect("construction must fail on a two-partition topic");
        assert!(matches!(
            err,
            ConsumerError::InvalidPartitionCount { count: 2, .. }
        ));
    }

    #[tokio::test]
    async fn topic_mode_must_match_the_consumer_class() {
        let repository = Arc::new(Repository::new());
        let config = Arc::new(test_config());
        let err = BatchConsumerCore::new(
            repository,
            "in.id.d1.m.batch.t.events",
            300,
            BusMode::Retry,
            config,
        )
        .await
        .err()
        .expect("mode mismatch must fail construction");
        assert!(matches!(err, ConsumerError::InvalidTopic(_)));
    }

    #[test]
    fn accumulate_covers_every_counter() {
        let mut total = BatchCounters::default();
        let batch = BatchCounters {
            consumed: 7,
            skipped: 1,
            processed: 4,
            not_ready_readded: 2,
            retry_scheduled: 3,
            dead_lettered: 1,
            failed: 2,
        };
        total.accumulate(batch);
        total.accumulate(BatchCounters::default());
        assert_eq!(total, batch);

        // Every field participates in accumulation and display.
        let fields = total.fields();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields.iter().map(|(_, v)| v).sum::<u64>(), 20);
    }

    #[test]
    fn display_prints_only_non_zero_fields() {
        let counters = BatchCounters {
            consumed: 3,
            failed: 1,
            ..Default::default()
        };
        let printed = counters.to_string();
        assert_eq!(printed, "consumed: 3 failed: 1 ");
    }
}
