use std::time::Duration;

use rdkafka::consumer::{ConsumerContext, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::OwnedMessage;

/// Whether a bus error is worth waiting out. Anything else means the client
/// is in a state only a fresh consumer can recover from.
pub fn is_retriable(err: &KafkaError) -> bool {
    matches!(
        err.rdkafka_error_code(),
        Some(
            RDKafkaErrorCode::QueueFull
                | RDKafkaErrorCode::OperationTimedOut
                | RDKafkaErrorCode::RequestTimedOut
                | RDKafkaErrorCode::BrokerTransportFailure
                | RDKafkaErrorCode::AllBrokersDown
        )
    )
}

/// Short error code for metric labels.
pub fn kafka_error_code(err: &KafkaError) -> String {
    match err.rdkafka_error_code() {
        Some(code) => format!("{code:?}"),
        None => "unknown".to_string(),
    }
}

/// Reads one message with a bounded wait. A timeout is a normal signal and
/// comes back as `Ok(None)`; the message is detached so the consumer can be
/// paused, sought, or swapped while the caller still holds it.
pub async fn read_message<C>(
    consumer: &StreamConsumer<C>,
    wait: Duration,
) -> Result<Option<OwnedMessage>, KafkaError>
where
    C: ConsumerContext + 'static,
{
    match tokio::time::timeout(wait, consumer.recv()).await {
        Err(_elapsed) => Ok(None),
        Ok(Ok(message)) => Ok(Some(message.detach())),
        Ok(Err(err)) => Err(err),
    }
}
