//! Retry policy: decides backoff delays for transient marketplace failures.

use std::time::Duration;

use rand::Rng;

use crate::config::MarketplaceConfig;

/// Exponential backoff with a cap and full jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Upper bound of any single delay.
    pub max_delay: Duration,

    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn from_config(config: &MarketplaceConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            max_retries: config.max_retries,
        }
    }

    /// Can another attempt follow attempt number `attempts` (1-indexed)?
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// Ceiling of the delay after `attempts` failures (1-indexed).
    ///
    /// delay = min(base_delay * multiplier^(attempts - 1), max_delay)
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }

    /// Full jitter: uniform in `[0, next_delay(attempts)]`.
    pub fn jittered_delay<R: Rng>(&self, attempts: u32, rng: &mut R) -> Duration {
        let ceiling = self.next_delay(attempts);
        if ceiling.is_zero() {
            return ceiling;
        }
        ceiling.mul_f64(rng.gen_range(0.0..=1.0))
    }
}
