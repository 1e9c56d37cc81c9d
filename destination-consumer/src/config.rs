use std::time::Duration;

use common_kafka::KafkaConfig;
use envconfig::Envconfig;
use uuid::Uuid;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    /// Stable id of this node, used for `group.instance.id` and transactional
    /// id fencing. Falls back to a random uuid per process.
    #[envconfig(from = "INSTANCE_ID")]
    pub instance_id: Option<String>,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3049")]
    pub port: u16,

    /// JSON file with the destination configs this node serves. Stands in for
    /// the dynamic configuration source.
    pub destinations_path: Option<String>,

    // Batch runner defaults; per-destination options override them.
    #[envconfig(default = "300")]
    pub batch_runner_default_period_sec: u64,

    #[envconfig(default = "300")]
    pub batch_runner_default_retry_period_sec: u64,

    #[envconfig(default = "10000")]
    pub batch_runner_default_batch_size: usize,

    #[envconfig(default = "0.1")]
    pub batch_runner_default_retry_batch_fraction: f64,

    #[envconfig(default = "5")]
    pub batch_runner_wait_for_messages_sec: u64,

    /// Attempts before a message is parked on the dead-letter topic.
    #[envconfig(default = "5")]
    pub messages_retry_count: i32,

    #[envconfig(default = "5")]
    pub messages_retry_backoff_base_min: f64,

    #[envconfig(default = "1440")]
    pub messages_retry_backoff_max_delay_min: f64,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,
}

impl Config {
    pub fn init() -> Result<Self, envconfig::Error> {
        let mut config = Self::init_from_env()?;
        if config.instance_id.is_none() {
            config.instance_id = Some(Uuid::new_v4().to_string());
        }
        Ok(config)
    }

    pub fn instance_id(&self) -> &str {
        self.instance_id.as_deref().unwrap_or("unknown")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn wait_for_messages(&self) -> Duration {
        Duration::from_secs(self.batch_runner_wait_for_messages_sec)
    }

    /// Batch consumers spend long stretches between polls while loading a
    /// batch into the destination; stretch the session timeout to match once
    /// the wait window exceeds the broker default.
    pub fn session_timeout_override_ms(&self) -> Option<u32> {
        if self.batch_runner_wait_for_messages_sec > 30 {
            Some((self.batch_runner_wait_for_messages_sec * 2 * 1000) as u32)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::test_utils::test_config;

    #[test]
    fn session_timeout_tracks_the_wait_window() {
        let mut config = test_config();
        config.batch_runner_wait_for_messages_sec = 5;
        assert_eq!(config.session_timeout_override_ms(), None);

        config.batch_runner_wait_for_messages_sec = 60;
        assert_eq!(config.session_timeout_override_ms(), Some(120_000));
    }
}
