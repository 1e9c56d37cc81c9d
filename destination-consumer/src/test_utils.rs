//! Shared fixtures for unit tests: a recording sink, an in-memory events
//! log, and a fully populated config.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common_kafka::KafkaConfig;
use serde_json::Value;
use sink_core::{
    BulkMode, ConsumeOutcome, EventObject, Mutator, SinkError, SinkFactory, SinkStream,
    StreamOptions, StreamState, StreamStatus,
};

use crate::config::Config;
use crate::destination::{Destination, DestinationConfig};
use crate::events_log::{EventType, EventsLogService};

pub struct RecordingSinkState {
    pub consumed: Mutex<Vec<EventObject>>,
    pub completes: AtomicUsize,
    pub aborts: AtomicUsize,
    pub fail_consume: AtomicBool,
}

/// Sink factory whose streams record every interaction for assertions.
#[derive(Default)]
pub struct RecordingSinkFactory {
    streams: Mutex<Vec<Arc<RecordingSinkState>>>,
    /// New streams start failing `consume` when set.
    pub fail_consume: AtomicBool,
}

impl RecordingSinkFactory {
    /// Streams in creation order.
    pub fn streams(&self) -> Vec<Arc<RecordingSinkState>> {
        self.streams.lock().unwrap().clone()
    }
}

#[async_trait]
impl SinkFactory for RecordingSinkFactory {
    async fn create_stream(
        &self,
        _topic_id: &str,
        _table_name: &str,
        _mode: BulkMode,
        mutators: &[Mutator],
    ) -> Result<Box<dyn SinkStream>, SinkError> {
        // Mirrors real factories: options are replayed per stream.
        let _options = StreamOptions::replay(mutators);
        let state = Arc::new(RecordingSinkState {
            consumed: Mutex::new(Vec::new()),
            completes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
            fail_consume: AtomicBool::new(self.fail_consume.load(Ordering::SeqCst)),
        });
        self.streams.lock().unwrap().push(state.clone());
        Ok(Box::new(RecordingSink { state }))
    }
}

struct RecordingSink {
    state: Arc<RecordingSinkState>,
}

impl RecordingSink {
    fn snapshot(&self, status: StreamStatus) -> StreamState {
        StreamState {
            status,
            processed_rows: self.state.consumed.lock().unwrap().len(),
            representation: None,
            last_error: None,
        }
    }
}

#[async_trait]
impl SinkStream for RecordingSink {
    async fn consume(&self, event: EventObject) -> Result<ConsumeOutcome, SinkError> {
        if self.state.fail_consume.load(Ordering::SeqCst) {
            return Err(SinkError::Sink("induced sink failure".to_string()));
        }
        self.state.consumed.lock().unwrap().push(event.clone());
        Ok(ConsumeOutcome {
            state: self.snapshot(StreamStatus::Active),
            processed: vec![event],
        })
    }

    async fn complete(&self) -> Result<StreamState, SinkError> {
        self.state.completes.fetch_add(1, Ordering::SeqCst);
        Ok(self.snapshot(StreamStatus::Completed))
    }

    async fn abort(&self) -> Result<StreamState, SinkError> {
        self.state.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(self.snapshot(StreamStatus::Aborted))
    }

    fn state(&self) -> StreamState {
        self.snapshot(StreamStatus::Active)
    }
}

pub fn destination_with_factory(
    id: &str,
    options: Value,
    factory: Arc<RecordingSinkFactory>,
) -> Arc<Destination> {
    let config = DestinationConfig {
        id: id.to_string(),
        updated_at: "2024-01-01T00:00:00Z".to_string(),
        tables: vec!["events".to_string()],
        options: options.as_object().cloned().unwrap_or_default(),
    };
    Arc::new(Destination::new(config, factory).unwrap())
}

pub fn destination_with_options(id: &str, options: Value) -> Arc<Destination> {
    destination_with_factory(id, options, Arc::new(RecordingSinkFactory::default()))
}

#[derive(Default)]
pub struct MemoryEventsLog {
    events: Mutex<Vec<(EventType, String, Value)>>,
}

impl MemoryEventsLog {
    pub fn events(&self) -> Vec<(EventType, String, Value)> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventsLogService for MemoryEventsLog {
    async fn post_event(
        &self,
        event_type: EventType,
        destination_id: &str,
        payload: Value,
    ) -> anyhow::Result<()> {
        self.events
            .lock()
            .unwrap()
            .push((event_type, destination_id.to_string(), payload));
        Ok(())
    }
}

pub fn test_config() -> Config {
    Config {
        instance_id: Some("test-instance".to_string()),
        host: "127.0.0.1".to_string(),
        port: 0,
        destinations_path: None,
        batch_runner_default_period_sec: 300,
        batch_runner_default_retry_period_sec: 300,
        batch_runner_default_batch_size: 10_000,
        batch_runner_default_retry_batch_fraction: 0.1,
        batch_runner_wait_for_messages_sec: 5,
        messages_retry_count: 5,
        messages_retry_backoff_base_min: 5.0,
        messages_retry_backoff_max_delay_min: 1440.0,
        kafka: KafkaConfig {
            kafka_hosts: "localhost:9092".to_string(),
            kafka_tls: false,
            kafka_producer_linger_ms: 20,
            kafka_producer_queue_mib: 400,
            kafka_producer_queue_messages: 10_000_000,
            kafka_message_timeout_ms: 20_000,
            kafka_compression_codec: "none".to_string(),
        },
    }
}
