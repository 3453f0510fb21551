//! Retry policy implementation

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::duration_serde::millis;

/// Configuration for step retries
///
/// The delay before retrying a failed attempt is
/// `min(coefficient^attempt * base_delay, max_delay)`, optionally jittered.
///
/// # Example
///
/// ```
/// use tenantflow_engine::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_retries(3)
///     .with_base_delay(Duration::from_secs(1))
///     .with_max_delay(Duration::from_secs(60));
///
/// // Attempt 0 failed -> retry after 1s, attempt 1 failed -> 2s, attempt 2 failed -> 4s
/// assert_eq!(policy.delay_for_retry(2), Duration::from_secs(4));
/// assert!(!policy.has_retries_remaining(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt
    pub max_retries: u32,

    /// Delay after the first failed attempt
    #[serde(with = "millis")]
    pub base_delay: Duration,

    /// Maximum delay between retries
    #[serde(with = "millis")]
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with defaults
    ///
    /// - 3 retries (4 attempts in total)
    /// - 1 second base delay
    /// - 5 minute cap
    /// - 2x backoff coefficient
    /// - no jitter
    pub fn exponential() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_coefficient: 2.0,
            jitter: 0.0,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Set the number of retries
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the delay cap
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retrying after `failed_attempt` (0-based) failed
    pub fn delay_for_retry(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.min(62) as i32;
        let base = self.base_delay.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = base.min(self.max_delay.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).clamp(0.0, self.max_delay.as_secs_f64())
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether a step whose `failed_attempt` (0-based) just failed may run again
    pub fn has_retries_remaining(&self, failed_attempt: u32) -> bool {
        failed_attempt < self.max_retries
    }

    /// Total attempts a step may consume
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}
