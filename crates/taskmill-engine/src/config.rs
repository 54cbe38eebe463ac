//! Engine configuration.

use std::time::Duration;

use taskmill_models::PriorityTier;
use taskmill_queue::QueueKeys;

use crate::error::{EngineError, EngineResult};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker loops to spawn
    pub worker_count: usize,
    /// Per-attempt execution deadline; also the task lock TTL
    pub task_timeout: Duration,
    /// Retries after the first attempt before a task is dead-lettered
    pub max_retries: u32,
    /// Backoff delay for the first retry
    pub initial_retry_delay: Duration,
    /// Upper bound on the backoff delay
    pub max_retry_delay: Duration,
    /// Multiplier applied to the delay per retry
    pub backoff_factor: f64,
    /// How often a processing worker refreshes the task heartbeat
    pub heartbeat_interval: Duration,
    /// Heartbeat age beyond which a Processing task counts as orphaned
    pub orphan_timeout: Duration,
    /// Priority at or above which a task lands on the high queue
    pub priority_high_threshold: i32,
    /// Priority at or above which a task lands on the normal queue
    pub priority_normal_threshold: i32,
    /// DLQ length at which the watch loop warns
    pub dlq_alert_threshold: u64,
    /// Namespace for every broker key
    pub key_prefix: String,
    /// Priority assigned by plain submission
    pub default_priority: i32,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_count: 4,
            task_timeout: Duration::from_secs(300), // 5 minutes
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            heartbeat_interval: Duration::from_secs(15),
            orphan_timeout: Duration::from_secs(120),
            priority_high_threshold: 10,
            priority_normal_threshold: 5,
            dlq_alert_threshold: 10,
            key_prefix: "taskmill".to_string(),
            default_priority: 5,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            worker_count: std::env::var("TASKMILL_WORKER_COUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(4),
            task_timeout: Duration::from_secs(
                std::env::var("TASKMILL_TASK_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            max_retries: std::env::var("TASKMILL_MAX_RETRIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(3),
            initial_retry_delay: Duration::from_secs(
                std::env::var("TASKMILL_INITIAL_RETRY_DELAY_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
            max_retry_delay: Duration::from_secs(
                std::env::var("TASKMILL_MAX_RETRY_DELAY_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300),
            ),
            backoff_factor: std::env::var("TASKMILL_BACKOFF_FACTOR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2.0),
            heartbeat_interval: Duration::from_secs(
                std::env::var("TASKMILL_HEARTBEAT_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(15),
            ),
            orphan_timeout: Duration::from_secs(
                std::env::var("TASKMILL_ORPHAN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(120),
            ),
            priority_high_threshold: std::env::var("TASKMILL_PRIORITY_HIGH_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            priority_normal_threshold: std::env::var("TASKMILL_PRIORITY_NORMAL_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            dlq_alert_threshold: std::env::var("TASKMILL_DLQ_ALERT_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            key_prefix: std::env::var("TASKMILL_KEY_PREFIX")
                .unwrap_or_else(|_| "taskmill".to_string()),
            default_priority: std::env::var("TASKMILL_DEFAULT_PRIORITY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            shutdown_timeout: Duration::from_secs(
                std::env::var("TASKMILL_SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
        }
    }

    /// Check the configuration. The key prefix feeds every derived broker
    /// key, so whitespace or a colon in it would corrupt the namespace.
    pub fn validate(&self) -> EngineResult<()> {
        if self.key_prefix.is_empty() {
            return Err(EngineError::config("key_prefix must not be empty"));
        }
        if self.key_prefix.contains(char::is_whitespace) || self.key_prefix.contains(':') {
            return Err(EngineError::config(
                "key_prefix must not contain whitespace or ':'",
            ));
        }
        Ok(())
    }

    /// Map a priority value onto its physical queue tier.
    pub fn tier_for_priority(&self, priority: i32) -> PriorityTier {
        if priority >= self.priority_high_threshold {
            PriorityTier::High
        } else if priority >= self.priority_normal_threshold {
            PriorityTier::Normal
        } else {
            PriorityTier::Low
        }
    }

    /// Backoff delay before retry `attempt` (1-based):
    /// `min(initial_retry_delay * backoff_factor^(attempt-1), max_retry_delay)`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let delay =
            self.initial_retry_delay.as_secs_f64() * self.backoff_factor.powi(exponent as i32);
        Duration::from_secs_f64(delay.min(self.max_retry_delay.as_secs_f64()))
    }

    /// Derived broker key namespace.
    pub fn queue_keys(&self) -> QueueKeys {
        QueueKeys::new(&self.key_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_prefixes() {
        let mut config = Config::default();

        config.key_prefix = String::new();
        assert!(config.validate().is_err());

        config.key_prefix = "has space".to_string();
        assert!(config.validate().is_err());

        config.key_prefix = "has:colon".to_string();
        assert!(config.validate().is_err());

        config.key_prefix = "tm-prod".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tier_for_priority_thresholds() {
        let config = Config {
            priority_high_threshold: 10,
            priority_normal_threshold: 5,
            ..Default::default()
        };

        assert_eq!(config.tier_for_priority(15), PriorityTier::High);
        assert_eq!(config.tier_for_priority(10), PriorityTier::High);
        assert_eq!(config.tier_for_priority(9), PriorityTier::Normal);
        assert_eq!(config.tier_for_priority(5), PriorityTier::Normal);
        assert_eq!(config.tier_for_priority(4), PriorityTier::Low);
        assert_eq!(config.tier_for_priority(-1), PriorityTier::Low);
    }

    #[test]
    fn test_retry_delay_formula() {
        let config = Config {
            initial_retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(60),
            backoff_factor: 2.0,
            ..Default::default()
        };

        assert_eq!(config.retry_delay(1), Duration::from_secs(5));
        assert_eq!(config.retry_delay(2), Duration::from_secs(10));
        assert_eq!(config.retry_delay(3), Duration::from_secs(20));
        assert_eq!(config.retry_delay(4), Duration::from_secs(40));
        // Capped at max_retry_delay from here on
        assert_eq!(config.retry_delay(5), Duration::from_secs(60));
        assert_eq!(config.retry_delay(10), Duration::from_secs(60));
    }

    #[test]
    fn test_default_priority_lands_on_normal_tier() {
        let config = Config::default();
        assert_eq!(
            config.tier_for_priority(config.default_priority),
            PriorityTier::Normal
        );
    }
}
