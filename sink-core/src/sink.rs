use std::sync::Mutex;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::options::{BulkMode, Mutator, StreamOptions};

/// A decoded event record. Keys are column names; numeric values keep their
/// full textual precision (`serde_json` arbitrary-precision numbers) until
/// the sink picks a concrete type.
pub type EventObject = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("event payload is not a JSON object")]
    NotAnObject,
    #[error("failed to decode event: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("sink stream already closed")]
    StreamClosed,
    #[error("{0}")]
    Sink(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Active,
    Completed,
    Aborted,
    Failed,
}

/// Observable state of a sink stream, returned by `state`, `complete` and
/// `abort` and attached to events-log entries.
#[derive(Debug, Clone, Serialize)]
pub struct StreamState {
    pub status: StreamStatus,
    pub processed_rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub representation: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl StreamState {
    pub fn active() -> Self {
        Self {
            status: StreamStatus::Active,
            processed_rows: 0,
            representation: None,
            last_error: None,
        }
    }
}

/// Result of feeding one event into a sink stream.
pub struct ConsumeOutcome {
    pub state: StreamState,
    /// Objects as the sink mapped them, for the events log.
    pub processed: Vec<EventObject>,
}

/// Per-table object owned by a destination. Accepts events one at a time and
/// persists them on `complete`; `abort` discards whatever the sink buffered.
#[async_trait]
pub trait SinkStream: Send + Sync {
    async fn consume(&self, event: EventObject) -> Result<ConsumeOutcome, SinkError>;
    async fn complete(&self) -> Result<StreamState, SinkError>;
    async fn abort(&self) -> Result<StreamState, SinkError>;
    fn state(&self) -> StreamState;
}

/// Factory for sink streams, one per destination. The recorded mutator
/// sequence is replayed onto a fresh options bag for every stream so a
/// recreated stream observes exactly the configured options.
#[async_trait]
pub trait SinkFactory: Send + Sync {
    async fn create_stream(
        &self,
        topic_id: &str,
        table_name: &str,
        mode: BulkMode,
        mutators: &[Mutator],
    ) -> Result<Box<dyn SinkStream>, SinkError>;
}

/// Decodes an event payload, preserving numeric precision.
pub fn decode_event(payload: &[u8]) -> Result<EventObject, SinkError> {
    match serde_json::from_slice::<Value>(payload)? {
        Value::Object(map) => Ok(map),
        _ => Err(SinkError::NotAnObject),
    }
}

/// Reference sink that logs consumed events. Useful for wiring checks and
/// local runs; real destinations plug in their own [`SinkFactory`].
pub struct StdoutSinkFactory;

#[async_trait]
impl SinkFactory for StdoutSinkFactory {
    async fn create_stream(
        &self,
        topic_id: &str,
        table_name: &str,
        mode: BulkMode,
        mutators: &[Mutator],
    ) -> Result<Box<dyn SinkStream>, SinkError> {
        let options = StreamOptions::replay(mutators);
        info!(topic_id, table_name, mode = mode.as_str(), "creating stdout sink stream");
        Ok(Box::new(StdoutSinkStream {
            table_name: table_name.to_string(),
            options,
            state: Mutex::new(StreamState::active()),
        }))
    }
}

struct StdoutSinkStream {
    table_name: String,
    #[allow(dead_code)]
    options: StreamOptions,
    state: Mutex<StreamState>,
}

impl StdoutSinkStream {
    fn finish(&self, status: StreamStatus) -> Result<StreamState, SinkError> {
        let mut state = self.state.lock().unwrap();
        if state.status != StreamStatus::Active {
            return Err(SinkError::StreamClosed);
        }
        state.status = status;
        Ok(state.clone())
    }
}

#[async_trait]
impl SinkStream for StdoutSinkStream {
    async fn consume(&self, event: EventObject) -> Result<ConsumeOutcome, SinkError> {
        let mut state = self.state.lock().unwrap();
        if state.status != StreamStatus::Active {
            return Err(SinkError::StreamClosed);
        }
        state.processed_rows += 1;
        info!(table = %self.table_name, "event: {}", serde_json::Value::Object(event.clone()));
        Ok(ConsumeOutcome {
            state: state.clone(),
            processed: vec![event],
        })
    }

    async fn complete(&self) -> Result<StreamState, SinkError> {
        self.finish(StreamStatus::Completed)
    }

    async fn abort(&self) -> Result<StreamState, SinkError> {
        self.finish(StreamStatus::Aborted)
    }

    fn state(&self) -> StreamState {
        self.state.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::BulkMode;

    #[test]
    fn decode_preserves_numeric_precision() {
        let payload = br#"{"id":"e1","big":92233720368547758080001,"frac":0.30000000000000004}"#;
        let object = decode_event(payload).unwrap();
        // Round-tripping through the decoded object must not lose digits.
        assert_eq!(
            serde_json::to_string(&object["big"]).unwrap(),
            "92233720368547758080001"
        );
        assert_eq!(
            serde_json::to_string(&object["frac"]).unwrap(),
            "0.30000000000000004"
        );
    }

    #[test]
    fn decode_rejects_non_objects() {
        assert!(matches!(
            decode_event(b"[1,2,3]"),
            Err(SinkError::NotAnObject)
        ));
        assert!(matches!(decode_event(b"not json"), Err(SinkError::Decode(_))));
    }

    #[tokio::test]
    async fn stdout_stream_counts_rows_and_closes_once() {
        let factory = StdoutSinkFactory;
        let stream = factory
            .create_stream("in.id.d1.m.stream.t.events", "events", BulkMode::Stream, &[])
            .await
            .unwrap();

        let event = decode_event(br#"{"id":"e1"}"#).unwrap();
        let outcome = stream.consume(event).await.unwrap();
        assert_eq!(outcome.state.processed_rows, 1);

        let state = stream.complete().await.unwrap();
        assert_eq!(state.status, StreamStatus::Completed);
        assert!(stream.complete().await.is_err());
        assert!(stream
            .consume(decode_event(br#"{"id":"e2"}"#).unwrap())
            .await
            .is_err());
    }
}
