use std::time::Duration;

use common_kafka::headers::{
    build_retry_headers, get_header, retries_count, retry_time, MESSAGE_ID_HEADER,
    ORIGINAL_TOPIC_HEADER, RETRY_TIME_HEADER,
};
use common_kafka::test::create_mock_kafka;
use common_kafka::transaction::TransactionalProducer;
use common_kafka::{create_producer, read_message, KafkaConfig};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::{Offset, TopicPartitionList};

const READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Consumer pinned to partition 0 of a topic; assignment avoids group
/// membership so the mock broker stays out of rebalance territory.
fn assigned_consumer(config: &KafkaConfig, group: &str, topic: &str) -> StreamConsumer {
    let consumer: StreamConsumer = config
        .consumer_client_config(group, "test-instance", false, None)
        .create()
        .expect("failed to create consumer");
    let mut assignment = TopicPartitionList::new();
    assignment
        .add_partition_offset(topic, 0, Offset::Beginning)
        .expect("failed to build assignment");
    consumer.assign(&assignment).expect("failed to assign");
    consumer
}

#[tokio::test]
async fn retry_envelope_roundtrips_through_the_bus() {
    let (cluster, config) = create_mock_kafka();
    let topic = "in.id.d1.m.retry.t._all_";
    cluster.create_topic(topic, 1, 1).expect("failed to create topic");

    let producer = create_producer(&config).expect("failed to create producer");
    let headers = build_retry_headers(
        "in.id.d1.m.stream.t.events",
        2,
        Some("2024-05-17T12:30:00.000Z"),
        Some("msg-1"),
    );
    common_kafka::produce_sync(&producer, topic, Some(b"k1"), br#"{"id":"e1"}"#, headers)
        .await
        .expect("failed to produce");

    let consumer = assigned_consumer(&config, topic, topic);
    let message = read_message(&consumer, READ_TIMEOUT)
        .await
        .expect("read failed")
        .expect("no message before timeout");

    assert_eq!(message.payload(), Some(br#"{"id":"e1"}"#.as_ref()));
    assert_eq!(message.key(), Some(b"k1".as_ref()));
    assert_eq!(
        get_header(&message, ORIGINAL_TOPIC_HEADER),
        Some("in.id.d1.m.stream.t.events")
    );
    assert_eq!(retries_count(&message).unwrap(), 2);
    // Deadline survives byte-for-byte and still parses.
    assert_eq!(
        get_header(&message, RETRY_TIME_HEADER),
        Some("2024-05-17T12:30:00.000Z")
    );
    assert!(retry_time(&message).unwrap().is_some());
    assert_eq!(get_header(&message, MESSAGE_ID_HEADER), Some("msg-1"));
}

#[tokio::test]
async fn committed_transaction_makes_messages_visible() {
    let (cluster, config) = create_mock_kafka();
    let topic = "in.id.d2.m.stream.t.events";
    cluster.create_topic(topic, 1, 1).expect("failed to create topic");

    let (mut producer, reports) =
        TransactionalProducer::new(&config, "test-tx-1", Duration::from_secs(10))
            .expect("failed to create transactional producer");
    tokio::spawn(reports.drain());

    let tx = producer.begin().expect("failed to begin transaction");
    for i in 0..3 {
        let payload = format!(r#"{{"id":"e{i}"}}"#);
        let headers = build_retry_headers(topic, i, None, Some("m"));
        tx.send(topic, None, payload.as_bytes(), headers, "m")
            .expect("failed to queue message");
    }
    tx.commit().expect("failed to commit transaction");

    // read_committed consumer (the builder default) sees all three.
    let consumer = assigned_consumer(&config, "tx-reader", topic);
    for _ in 0..3 {
        let message = read_message(&consumer, READ_TIMEOUT)
            .await
            .expect("read failed")
            .expect("missing committed message");
        assert!(message.payload().is_some());
    }
}
