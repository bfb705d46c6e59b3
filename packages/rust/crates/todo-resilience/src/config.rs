//! Retry, load-balancing and circuit breaker configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RetryError};

/// How the next node is chosen among the usable ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancing {
    /// Highest health score first, then lowest average latency.
    #[default]
    Health,
    /// Rotate through the pool in declaration order.
    RoundRobin,
    /// Lowest priority value first.
    Priority,
}

/// Per-node circuit breaker thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Time an open circuit waits before a half-open probe.
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub(crate) fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Configuration for one retry engine (one node pool).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Backoff before the second attempt (milliseconds).
    pub initial_delay_ms: u64,
    /// Upper bound for any backoff (milliseconds).
    pub max_delay_ms: u64,
    /// Attempt cap across the whole pool.
    pub max_retries: u32,
    /// Wall-clock budget for one `execute` call (milliseconds).
    pub max_duration_ms: u64,
    /// Timeout applied to each attempt (milliseconds).
    pub per_attempt_timeout_ms: u64,
    /// Multiplicative factor applied per attempt.
    pub backoff_multiplier: f64,
    /// Stretch backoff for unhealthy nodes, shrink it for healthy ones.
    pub adaptive_delay: bool,
    /// Node selection strategy.
    pub load_balancing: LoadBalancing,
    /// Fail fast when fewer nodes than this are usable.
    pub min_nodes: usize,
    /// Nodes scoring below this are skipped even with a closed circuit.
    pub health_threshold: f64,
    /// Outcomes kept per node for the health score.
    pub health_window: usize,
    /// Circuit breaker thresholds.
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_retries: 5,
            max_duration_ms: 60_000,
            per_attempt_timeout_ms: 15_000,
            backoff_multiplier: 2.0,
            adaptive_delay: true,
            load_balancing: LoadBalancing::Health,
            min_nodes: 1,
            health_threshold: 0.3,
            health_window: 10,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl RetryConfig {
    /// Reject settings the engine cannot honour.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_retries == 0 {
            return Err(RetryError::InvalidConfig(
                "max_retries must be at least 1".to_string(),
            ));
        }
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(RetryError::InvalidConfig(format!(
                "max_delay_ms ({}) is below initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            )));
        }
        if !(self.health_threshold > 0.0 && self.health_threshold < 1.0) {
            return Err(RetryError::InvalidConfig(format!(
                "health_threshold must be in (0, 1), got {}",
                self.health_threshold
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(RetryError::InvalidConfig(format!(
                "backoff_multiplier must be >= 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(RetryError::InvalidConfig(
                "circuit_breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.health_window == 0 {
            return Err(RetryError::InvalidConfig(
                "health_window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub(crate) fn max_duration(&self) -> Duration {
        Duration::from_millis(self.max_duration_ms)
    }

    pub(crate) fn per_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.per_attempt_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RetryConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_threshold_outside_open_interval() {
        let config = RetryConfig {
            health_threshold: 1.0,
            ..RetryConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(RetryError::InvalidConfig(msg)) if msg.contains("health_threshold")
        ));
    }

    #[test]
    fn rejects_inverted_delays() {
        let config = RetryConfig {
            initial_delay_ms: 500,
            max_delay_ms: 100,
            ..RetryConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_balancing_parses_kebab_case() {
        let parsed: LoadBalancing = serde_json::from_str("\"round-robin\"").unwrap();
        assert_eq!(parsed, LoadBalancing::RoundRobin);
    }
}
