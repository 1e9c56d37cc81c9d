use envconfig::Envconfig;
use rdkafka::ClientConfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32, // Maximum number of messages in the in-memory producer queue

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

impl KafkaConfig {
    fn base_client_config(&self) -> ClientConfig {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &self.kafka_hosts)
            .set("statistics.interval.ms", "10000");

        if self.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };
        client_config
    }

    /// Consumer configuration for a per-topic consumer group. The group id is
    /// the topic id itself and is only known at consumer construction time,
    /// so this is programmatic rather than env-driven.
    pub fn consumer_client_config(
        &self,
        group_id: &str,
        instance_id: &str,
        auto_commit: bool,
        session_timeout_ms: Option<u32>,
    ) -> ClientConfig {
        let mut client_config = self.base_client_config();
        client_config
            .set("group.id", group_id)
            .set("group.instance.id", instance_id)
            .set("auto.offset.reset", "earliest")
            .set("isolation.level", "read_committed")
            .set("enable.auto.commit", auto_commit.to_string());
        if let Some(timeout_ms) = session_timeout_ms {
            client_config.set("session.timeout.ms", timeout_ms.to_string());
        }
        client_config
    }

    pub fn producer_client_config(&self, transactional_id: Option<&str>) -> ClientConfig {
        let mut client_config = self.base_client_config();
        client_config
            .set("linger.ms", self.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                self.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                self.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (self.kafka_producer_queue_mib * 1024).to_string(),
            )
            .set(
                "queue.buffering.max.messages",
                self.kafka_producer_queue_messages.to_string(),
            );
        if let Some(transactional_id) = transactional_id {
            client_config.set("transactional.id", transactional_id);
        }
        client_config
    }
}
