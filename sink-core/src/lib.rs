//! Sink-facing core: destination stream options, topic id encoding, and the
//! sink stream surface shared by the consumer runtime and sink adapters.

pub mod options;
pub mod sink;
pub mod topic;

pub use options::{
    BulkMode, Mutator, OptionError, OptionValue, Registry, RegistryBuilder, StreamOptions,
    BATCH_FREQUENCY_OPTION, BATCH_SIZE_OPTION, DEDUPLICATE_OPTION, MODE_OPTION,
    PARTITION_ID_OPTION, PRIMARY_KEY_OPTION, RETRY_BATCH_SIZE_OPTION, RETRY_FREQUENCY_OPTION,
    TIMESTAMP_COLUMN_OPTION,
};
pub use sink::{
    decode_event, ConsumeOutcome, EventObject, SinkError, SinkFactory, SinkStream,
    StdoutSinkFactory, StreamState, StreamStatus,
};
pub use topic::{BusMode, TopicError, TopicId, ALL_TABLES};
