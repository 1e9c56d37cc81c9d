use rdkafka::error::KafkaError;
use sink_core::{OptionError, SinkError, TopicError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    InvalidTopic(#[from] TopicError),

    #[error("topic {topic} has {count} partitions; batch consumers support only single-partition topics")]
    InvalidPartitionCount { topic: String, count: usize },

    #[error(transparent)]
    Options(#[from] OptionError),

    #[error("destination not found: {0}")]
    DestinationMissing(String),

    #[error("consumer is retired")]
    Retired,

    #[error("resume timeout")]
    ResumeTimeout,

    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error("{0}")]
    Internal(String),
}
