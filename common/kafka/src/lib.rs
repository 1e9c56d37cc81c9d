//! Shared Kafka plumbing: client configuration, the transactional producer
//! used for exactly-once retry handoff, the plain producer, and the retry
//! envelope header conventions.

pub mod config;
pub mod errors;
pub mod headers;
pub mod producer;
pub mod test;
pub mod transaction;

pub use config::KafkaConfig;
pub use errors::{is_retriable, kafka_error_code, read_message};
pub use producer::{create_producer, produce_sync};
pub use transaction::{DeliveryReports, KafkaTransaction, TransactionalProducer};
