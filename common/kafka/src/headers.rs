use chrono::{DateTime, SecondsFormat, Utc};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::Message;
use thiserror::Error;

/// Topic where the message must ultimately land once it becomes eligible for
/// redelivery.
pub const ORIGINAL_TOPIC_HEADER: &str = "original_topic";
/// Number of prior delivery attempts, as a decimal integer.
pub const RETRIES_COUNT_HEADER: &str = "retries";
/// Earliest redelivery time, RFC 3339 UTC.
pub const RETRY_TIME_HEADER: &str = "retry_time";
/// Opaque id, used only for logging.
pub const MESSAGE_ID_HEADER: &str = "message_id";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("malformed '{name}' header: {message}")]
    Malformed { name: &'static str, message: String },
}

/// UTF-8 value of a header, if present and valid.
pub fn get_header<'a, M: Message>(message: &'a M, name: &str) -> Option<&'a str> {
    message
        .headers()?
        .iter()
        .find(|header| header.key == name)
        .and_then(|header| header.value)
        .and_then(|value| std::str::from_utf8(value).ok())
}

/// Prior attempt count; a missing header means no attempts yet.
pub fn retries_count<M: Message>(message: &M) -> Result<i32, HeaderError> {
    match get_header(message, RETRIES_COUNT_HEADER) {
        None => Ok(0),
        Some(raw) => raw.trim().parse().map_err(|_| HeaderError::Malformed {
            name: RETRIES_COUNT_HEADER,
            message: format!("'{raw}' is not an integer"),
        }),
    }
}

/// Earliest redelivery time, if the header is present.
pub fn retry_time<M: Message>(message: &M) -> Result<Option<DateTime<Utc>>, HeaderError> {
    match get_header(message, RETRY_TIME_HEADER) {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|time| Some(time.with_timezone(&Utc)))
            .map_err(|err| HeaderError::Malformed {
                name: RETRY_TIME_HEADER,
                message: err.to_string(),
            }),
    }
}

pub fn format_retry_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Assembles the retry envelope. `retry_time` is carried verbatim so a
/// requeued message keeps its original deadline byte-for-byte.
pub fn build_retry_headers(
    original_topic: &str,
    retries: i32,
    retry_time: Option<&str>,
    message_id: Option<&str>,
) -> OwnedHeaders {
    let retries = retries.to_string();
    let mut headers = OwnedHeaders::new()
        .insert(Header {
            key: ORIGINAL_TOPIC_HEADER,
            value: Some(original_topic),
        })
        .insert(Header {
            key: RETRIES_COUNT_HEADER,
            value: Some(retries.as_str()),
        });
    if let Some(retry_time) = retry_time {
        headers = headers.insert(Header {
            key: RETRY_TIME_HEADER,
            value: Some(retry_time),
        });
    }
    if let Some(message_id) = message_id {
        headers = headers.insert(Header {
            key: MESSAGE_ID_HEADER,
            value: Some(message_id),
        });
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rdkafka::message::OwnedMessage;
    use rdkafka::Timestamp;

    fn message_with_headers(headers: OwnedHeaders) -> OwnedMessage {
        OwnedMessage::new(
            Some(b"{}".to_vec()),
            None,
            "in.id.d1.m.retry.t._all_".to_string(),
            Timestamp::NotAvailable,
            0,
            0,
            Some(headers),
        )
    }

    #[test]
    fn envelope_roundtrips_through_owned_headers() {
        let deadline = Utc.with_ymd_and_hms(2024, 5, 17, 12, 30, 0).unwrap();
        let formatted = format_retry_time(deadline);
        let message = message_with_headers(build_retry_headers(
            "in.id.d1.m.stream.t.events",
            3,
            Some(&formatted),
            Some("msg-42"),
        ));

        assert_eq!(
            get_header(&message, ORIGINAL_TOPIC_HEADER),
            Some("in.id.d1.m.stream.t.events")
        );
        assert_eq!(retries_count(&message).unwrap(), 3);
        assert_eq!(retry_time(&message).unwrap(), Some(deadline));
        assert_eq!(get_header(&message, MESSAGE_ID_HEADER), Some("msg-42"));
        // The deadline survives byte-for-byte.
        assert_eq!(get_header(&message, RETRY_TIME_HEADER), Some(formatted.as_str()));
    }

    #[test]
    fn missing_retries_header_counts_as_zero() {
        let message = message_with_headers(OwnedHeaders::new());
        assert_eq!(retries_count(&message).unwrap(), 0);
        assert_eq!(retry_time(&message).unwrap(), None);
    }

    #[test]
    fn malformed_headers_are_errors() {
        let message = message_with_headers(OwnedHeaders::new().insert(Header {
            key: RETRIES_COUNT_HEADER,
            value: Some("many"),
        }));
        assert!(retries_count(&message).is_err());

        let message = message_with_headers(OwnedHeaders::new().insert(Header {
            key: RETRY_TIME_HEADER,
            value: Some("tomorrow-ish"),
        }));
        assert!(retry_time(&message).is_err());
    }
}
