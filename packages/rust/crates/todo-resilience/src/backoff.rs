//! Backoff delay computation (pure, no side effects).
//!
//! - Exponential: `delay = initial_delay_ms * multiplier^(attempt-1)`
//! - Clamped to `max_delay_ms`
//! - Adaptive: scaled by `2 - health_score`, so a perfectly healthy node gets
//!   the base delay and a failing node up to twice that, never above the cap

use std::time::Duration;

use crate::config::RetryConfig;

/// Compute the delay in milliseconds after a failed attempt (1-indexed).
///
/// `health_score` is only consulted when `adaptive_delay` is enabled and is
/// clamped to `[0, 1]`. NaN, infinite and negative intermediates clamp to the
/// nearest bound.
#[must_use]
pub fn compute_delay(config: &RetryConfig, attempt: u32, health_score: f64) -> u64 {
    let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
    let base = (config.initial_delay_ms as f64) * config.backoff_multiplier.powi(exponent);

    let scaled = if config.adaptive_delay {
        let score = if health_score.is_nan() {
            0.0
        } else {
            health_score.clamp(0.0, 1.0)
        };
        base * (2.0 - score)
    } else {
        base
    };

    let max = config.max_delay_ms as f64;
    let clamped = if scaled.is_nan() || scaled < 0.0 {
        0.0
    } else if scaled > max {
        max
    } else {
        scaled
    };

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let delay = clamped as u64;
    delay.min(config.max_delay_ms)
}

/// [`compute_delay`] as a `Duration`.
#[must_use]
pub fn backoff(config: &RetryConfig, attempt: u32, health_score: f64) -> Duration {
    Duration::from_millis(compute_delay(config, attempt, health_score))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed(initial: u64, max: u64) -> RetryConfig {
        RetryConfig {
            initial_delay_ms: initial,
            max_delay_ms: max,
            adaptive_delay: false,
            ..RetryConfig::default()
        }
    }

    #[test]
    fn exponential_growth_until_cap() {
        let config = fixed(100, 1_000);
        assert_eq!(compute_delay(&config, 1, 1.0), 100);
        assert_eq!(compute_delay(&config, 2, 1.0), 200);
        assert_eq!(compute_delay(&config, 3, 1.0), 400);
        assert_eq!(compute_delay(&config, 4, 1.0), 800);
        assert_eq!(compute_delay(&config, 5, 1.0), 1_000);
        assert_eq!(compute_delay(&config, u32::MAX, 1.0), 1_000);
    }

    #[test]
    fn adaptive_delay_is_shorter_for_healthier_nodes() {
        let config = RetryConfig {
            adaptive_delay: true,
            ..fixed(100, 10_000)
        };
        let healthy = compute_delay(&config, 2, 1.0);
        let degraded = compute_delay(&config, 2, 0.5);
        let dead = compute_delay(&config, 2, 0.0);
        assert_eq!(healthy, 200);
        assert!(healthy < degraded && degraded < dead);
        assert_eq!(degraded, 300);
        assert_eq!(dead, 400);
    }

    #[test]
    fn adaptive_delay_respects_cap() {
        let config = RetryConfig {
            adaptive_delay: true,
            ..fixed(800, 1_000)
        };
        assert_eq!(compute_delay(&config, 1, 0.0), 1_000);
        assert_eq!(compute_delay(&config, 1, f64::NAN), 1_000);
    }
}
