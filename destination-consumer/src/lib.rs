//! Per-destination ingestion consumer runtime: reads event topics from the
//! bus, drives sink streams, and coordinates the retry/dead-letter pipeline
//! with exactly-once handoff.

pub mod backoff;
pub mod batch_consumer;
pub mod config;
pub mod destination;
pub mod errors;
pub mod events_log;
pub mod metrics;
pub mod retry_consumer;
pub mod stream_consumer;
pub mod table_batch_consumer;
pub mod tasks;
pub mod test_utils;

pub use batch_consumer::{BatchConsumer, BatchCounters};
pub use config::Config;
pub use destination::{Destination, DestinationConfig, Repository};
pub use errors::ConsumerError;
pub use retry_consumer::RetryConsumer;
pub use stream_consumer::StreamConsumer;
pub use table_batch_consumer::TableBatchConsumer;
