use async_trait::async_trait;
use serde_json::{json, Value};
use sink_core::EventObject;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    ProcessedAll,
    ProcessedError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ProcessedAll => "processedAll",
            EventType::ProcessedError => "processedError",
        }
    }
}

/// Boundary to the events-log storage (Redis upstream; pluggable here).
#[async_trait]
pub trait EventsLogService: Send + Sync {
    async fn post_event(
        &self,
        event_type: EventType,
        destination_id: &str,
        payload: Value,
    ) -> anyhow::Result<()>;
}

pub struct NoopEventsLog;

#[async_trait]
impl EventsLogService for NoopEventsLog {
    async fn post_event(&self, _: EventType, _: &str, _: Value) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds the per-message events-log payload and posts it. A failed message
/// is posted under `processedError` as well as the `processedAll` feed.
pub async fn post_events_log(
    service: &dyn EventsLogService,
    destination_id: &str,
    original: &[u8],
    representation: Option<&Value>,
    processed: &[EventObject],
    error: Option<&str>,
) {
    let mut object = json!({
        "original": String::from_utf8_lossy(original),
        "status": "SUCCESS",
    });
    if let Some(representation) = representation {
        object["representation"] = representation.clone();
    }
    if !processed.is_empty() {
        object["mappedData"] = Value::Array(processed.iter().cloned().map(Value::Object).collect());
    }
    if let Some(error) = error {
        object["error"] = Value::String(error.to_string());
        object["status"] = Value::String("FAILED".to_string());
        if let Err(err) = service
            .post_event(EventType::ProcessedError, destination_id, object.clone())
            .await
        {
            error!("Failed to post event to events log service: {err}");
        }
    }
    if let Err(err) = service
        .post_event(EventType::ProcessedAll, destination_id, object)
        .await
    {
        error!("Failed to post event to events log service: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MemoryEventsLog;
    use sink_core::decode_event;

    #[tokio::test]
    async fn success_posts_only_to_the_all_feed() {
        let log = MemoryEventsLog::default();
        let processed = vec![decode_event(br#"{"id":"e1"}"#).unwrap()];
        post_events_log(&log, "d1", br#"{"id":"e1"}"#, None, &processed, None).await;

        let events = log.events();
        assert_eq!(events.len(), 1);
        let (event_type, destination_id, payload) = &events[0];
        assert_eq!(*event_type, EventType::ProcessedAll);
        assert_eq!(destination_id, "d1");
        assert_eq!(payload["status"], "SUCCESS");
        assert_eq!(payload["mappedData"][0]["id"], "e1");
    }

    #[tokio::test]
    async fn failure_posts_to_both_feeds() {
        let log = MemoryEventsLog::default();
        post_events_log(&log, "d1", b"not json", None, &[], Some("parse error")).await;

        let events = log.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, EventType::ProcessedError);
        assert_eq!(events[1].0, EventType::ProcessedAll);
        assert_eq!(events[0].2["status"], "FAILED");
        assert_eq!(events[0].2["error"], "parse error");
    }
}
