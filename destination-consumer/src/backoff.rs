use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::Config;

/// Delay before redelivery attempt `attempt` (1-based):
/// `min(cap, base * 2^(attempt - 1))` minutes. Deterministic and monotonic;
/// no jitter, so retry deadlines are reproducible.
pub fn retry_backoff(config: &Config, attempt: i32) -> Duration {
    let attempt = attempt.max(1);
    let base = config.messages_retry_backoff_base_min.max(0.0);
    let cap = config.messages_retry_backoff_max_delay_min.max(0.0);
    let minutes = (base * 2f64.powi(attempt - 1)).min(cap);
    Duration::from_secs_f64(minutes * 60.0)
}

/// Absolute redelivery deadline for attempt `attempt`.
pub fn next_retry_time(config: &Config, attempt: i32) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::milliseconds(retry_backoff(config, attempt).as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_config;

    #[test]
    fn backoff_doubles_and_caps() {
        let mut config = test_config();
        config.messages_retry_backoff_base_min = 5.0;
        config.messages_retry_backoff_max_delay_min = 1440.0;

        assert_eq!(retry_backoff(&config, 1), Duration::from_secs(5 * 60));
        assert_eq!(retry_backoff(&config, 2), Duration::from_secs(10 * 60));
        assert_eq!(retry_backoff(&config, 3), Duration::from_secs(20 * 60));
        // 5 * 2^9 = 2560 minutes, above the 1440 cap.
        assert_eq!(retry_backoff(&config, 10), Duration::from_secs(1440 * 60));
    }

    #[test]
    fn backoff_is_monotonic() {
        let config = test_config();
        let mut previous = Duration::ZERO;
        for attempt in 1..=16 {
            let delay = retry_backoff(&config, attempt);
            assert!(delay >= previous, "attempt {attempt} shrank the delay");
            previous = delay;
        }
    }

    #[test]
    fn degenerate_attempts_use_the_base_delay() {
        let config = test_config();
        assert_eq!(retry_backoff(&config, 0), retry_backoff(&config, 1));
        assert_eq!(retry_backoff(&config, -3), retry_backoff(&config, 1));
    }
}
