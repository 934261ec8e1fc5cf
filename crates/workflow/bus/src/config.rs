//! Bus configuration and the retry policy

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Dequeues a non-empty tier may be passed over before it is served
    #[serde(default = "default_fairness_window")]
    pub fairness_window: u32,

    /// Delivery retry policy
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Default `request()` timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Upper bound on a single `Worker::handle` call in milliseconds
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_ms: u64,

    /// Number of queue consumer tasks
    #[serde(default = "default_consumers")]
    pub consumers: usize,

    /// Maximum concurrent delivery tasks
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Buffer size of each subscriber channel
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,

    /// Maximum explicit worker-to-worker handoffs per message
    #[serde(default = "default_max_hops")]
    pub max_hops: u8,

    /// Buffer size of the bus event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Settled delivery records kept for inspection; older ones are evicted
    #[serde(default = "default_ledger_retention")]
    pub ledger_retention: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            fairness_window: default_fairness_window(),
            retry: RetryPolicy::default(),
            request_timeout_ms: default_request_timeout(),
            attempt_timeout_ms: default_attempt_timeout(),
            consumers: default_consumers(),
            max_in_flight: default_max_in_flight(),
            subscriber_capacity: default_subscriber_capacity(),
            max_hops: default_max_hops(),
            event_capacity: default_event_capacity(),
            ledger_retention: default_ledger_retention(),
        }
    }
}

impl BusConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Check the configuration for values the bus cannot run with
    pub fn validate(&self) -> Result<(), String> {
        if self.fairness_window == 0 {
            return Err("bus.fairness_window must be at least 1".into());
        }
        if self.consumers == 0 || self.max_in_flight == 0 {
            return Err("bus.consumers and bus.max_in_flight must be at least 1".into());
        }
        if self.subscriber_capacity == 0 || self.event_capacity == 0 || self.ledger_retention == 0 {
            return Err("bus capacities and ledger_retention must be at least 1".into());
        }
        if self.request_timeout_ms == 0 || self.attempt_timeout_ms == 0 {
            return Err("bus timeouts must be non-zero".into());
        }
        self.retry.validate()
    }
}

/// Capped exponential backoff with additive jitter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Hard ceiling on delivery attempts, the first one included
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt (milliseconds)
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum backoff delay (milliseconds)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter as a fraction of the computed delay, added on top
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryPolicy {
    /// Backoff after the `failures`-th failed attempt, before jitter.
    ///
    /// `min(max_delay, initial_delay * multiplier^(failures - 1))`
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Backoff after the `failures`-th failed attempt with jitter applied
    pub fn jittered_delay_for(&self, failures: u32) -> Duration {
        let base = self.delay_for(failures);
        if self.jitter_ratio <= 0.0 {
            return base;
        }
        let spread = (base.as_millis() as f64 * self.jitter_ratio) as u64;
        if spread == 0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0..=spread);
        base + Duration::from_millis(extra)
    }

    /// Whether another attempt is allowed after `attempts` have failed
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("bus.retry.max_attempts must be at least 1".into());
        }
        if self.multiplier < 1.0 {
            return Err("bus.retry.multiplier must be >= 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err("bus.retry.jitter_ratio must be within 0.0..=1.0".into());
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err("bus.retry.initial_delay_ms exceeds max_delay_ms".into());
        }
        Ok(())
    }
}

// Default value helpers
fn default_fairness_window() -> u32 {
    8
}

fn default_request_timeout() -> u64 {
    30_000
}

fn default_attempt_timeout() -> u64 {
    30_000
}

fn default_consumers() -> usize {
    4
}

fn default_max_in_flight() -> usize {
    256
}

fn default_subscriber_capacity() -> usize {
    1024
}

fn default_max_hops() -> u8 {
    8
}

fn default_event_capacity() -> usize {
    1024
}

fn default_ledger_retention() -> usize {
    10_000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter_ratio() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let schedule: Vec<u64> = (1..=3)
            .map(|n| policy.delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(schedule, vec![1_000, 2_000, 4_000]);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(6), Duration::from_millis(30_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(30_000));
    }

    #[test]
    fn test_jitter_is_additive_and_bounded() {
        let policy = RetryPolicy::default();
        for _ in 0..100 {
            let d = policy.jittered_delay_for(2);
            assert!(d >= Duration::from_millis(2_000));
            assert!(d <= Duration::from_millis(2_200));
        }
    }

    #[test]
    fn test_retry_ceiling() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = BusConfig {
            fairness_window: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        assert!(BusConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: BusConfig =
            serde_json::from_str(r#"{"retry": {"max_attempts": 5}}"#).unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.fairness_window, 8);
    }
}
