//! Configuration schema shared by every backend adapter.

use crate::backoff::{Backoff, Jitter};
use crate::error::{BusError, BusResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which backoff curve the retry engine follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Exponential,
    Linear,
    Constant,
    Fibonacci,
}

/// Retry behavior for publish and connect operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt; an operation runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Multiplier for exponential backoff, reinterpreted as the step (in ms)
    /// for linear backoff.
    pub multiplier: f64,
    pub jitter: bool,
    pub strategy: BackoffStrategy,
    /// Case-insensitive substring allow-list. When non-empty, only errors
    /// whose message matches a pattern are retried.
    pub retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
            strategy: BackoffStrategy::Exponential,
            retryable_errors: Vec::new(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Materialize the configured backoff curve.
    pub fn backoff(&self) -> Backoff {
        let initial = self.initial_delay();
        let max = self.max_delay();
        match self.strategy {
            BackoffStrategy::Exponential => Backoff::exponential(initial, self.multiplier, max),
            BackoffStrategy::Linear => {
                Backoff::linear(initial, Duration::from_millis(self.multiplier as u64), max)
            }
            BackoffStrategy::Constant => Backoff::constant(initial),
            BackoffStrategy::Fibonacci => Backoff::fibonacci(initial, max),
        }
    }

    pub fn jitter_mode(&self) -> Jitter {
        if self.jitter {
            Jitter::proportional()
        } else {
            Jitter::None
        }
    }
}

/// Circuit-breaker thresholds; disabled by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Failures inside `failure_window_ms` that trip the breaker.
    pub failure_threshold: u32,
    pub failure_window_ms: u64,
    /// How long the breaker stays open before probing.
    pub reset_timeout_ms: u64,
    /// Consecutive half-open successes required to close again.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            failure_threshold: 5,
            failure_window_ms: 60_000,
            reset_timeout_ms: 30_000,
            success_threshold: 2,
        }
    }
}

/// Dead-letter routing for messages that exhaust their delivery budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    /// Destination queue/topic name.
    pub destination: Option<String>,
    pub max_delivery_attempts: u32,
    /// Record the triggering error in the dead-letter headers.
    pub include_error: bool,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self { enabled: false, destination: None, max_delivery_attempts: 3, include_error: true }
    }
}

/// Log level for adapter-emitted diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Adapter logging. Diagnostics go through `tracing`; this gates whether the
/// adapter emits them and at which minimum level.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub level: LogLevel,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enabled: true, level: LogLevel::Info }
    }
}

/// Base configuration every adapter accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Identifier surfaced to the broker; synthesized when absent.
    pub client_id: Option<String>,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub dead_letter: DeadLetterConfig,
    pub logging: LoggingConfig,
    pub connection_timeout_ms: u64,
    pub request_timeout_ms: u64,
}

impl BusConfig {
    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_ms > 0).then(|| Duration::from_millis(self.connection_timeout_ms))
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Reject configurations the runtime cannot honor.
    pub fn validate(&self) -> BusResult<()> {
        if self.retry.multiplier <= 0.0 || !self.retry.multiplier.is_finite() {
            return Err(BusError::configuration(format!(
                "retry.multiplier must be a positive finite number (got {})",
                self.retry.multiplier
            )));
        }
        if self.retry.max_delay_ms < self.retry.initial_delay_ms {
            return Err(BusError::configuration(format!(
                "retry.max_delay_ms ({}) must be >= retry.initial_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.initial_delay_ms
            )));
        }
        if self.circuit_breaker.enabled {
            if self.circuit_breaker.failure_threshold == 0 {
                return Err(BusError::configuration(
                    "circuit_breaker.failure_threshold must be > 0",
                ));
            }
            if self.circuit_breaker.success_threshold == 0 {
                return Err(BusError::configuration(
                    "circuit_breaker.success_threshold must be > 0",
                ));
            }
            if self.circuit_breaker.failure_window_ms == 0 {
                return Err(BusError::configuration("circuit_breaker.failure_window_ms must be > 0"));
            }
        }
        if self.dead_letter.enabled {
            if self.dead_letter.destination.as_deref().unwrap_or("").is_empty() {
                return Err(BusError::configuration(
                    "dead_letter.destination is required when dead_letter.enabled",
                ));
            }
            if self.dead_letter.max_delivery_attempts == 0 {
                return Err(BusError::configuration(
                    "dead_letter.max_delivery_attempts must be > 0",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn defaults_match_contract() {
        let config = BusConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 100);
        assert_eq!(config.retry.max_delay_ms, 10_000);
        assert_eq!(config.retry.multiplier, 2.0);
        assert!(config.retry.jitter);
        assert!(!config.circuit_breaker.enabled);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.failure_window_ms, 60_000);
        assert_eq!(config.circuit_breaker.reset_timeout_ms, 30_000);
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.dead_letter.max_delivery_attempts, 3);
        assert!(config.dead_letter.include_error);
        assert!(config.logging.enabled);
        assert_eq!(config.logging.level, LogLevel::Info);
    }

    #[test]
    fn default_config_validates() {
        assert!(BusConfig::default().validate().is_ok());
    }

    #[test]
    fn linear_strategy_reinterprets_multiplier_as_step() {
        let retry = RetryConfig {
            strategy: BackoffStrategy::Linear,
            initial_delay_ms: 100,
            multiplier: 50.0,
            ..Default::default()
        };
        let backoff = retry.backoff();
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(200));
    }

    #[test]
    fn invalid_multiplier_is_rejected() {
        let mut config = BusConfig::default();
        config.retry.multiplier = 0.0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.code(), "CONFIGURATION_ERROR");
        assert!(!err.retryable());
    }

    #[test]
    fn dlq_without_destination_is_rejected() {
        let mut config = BusConfig::default();
        config.dead_letter.enabled = true;
        assert!(config.validate().is_err());

        config.dead_letter.destination = Some("orders-dlq".into());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn breaker_thresholds_must_be_positive() {
        let mut config = BusConfig::default();
        config.circuit_breaker.enabled = true;
        config.circuit_breaker.failure_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_timeouts_mean_unbounded() {
        let mut config = BusConfig::default();
        config.connection_timeout_ms = 0;
        assert!(config.connection_timeout().is_none());
        config.request_timeout_ms = 1_500;
        assert_eq!(config.request_timeout(), Some(Duration::from_millis(1_500)));
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let config: BusConfig =
            serde_json::from_str(r#"{ "retry": { "max_retries": 7 } }"#).unwrap();
        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.initial_delay_ms, 100);
    }
}
