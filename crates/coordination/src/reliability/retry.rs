//! Retry policy for optimistic-concurrency collisions

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::duration_millis;

/// Bounded retry with exponential backoff and jitter
///
/// Used when a compare-and-swap on a constraint's queue version loses the
/// race. Delays are short: the competing writer has already committed, so
/// the next attempt usually succeeds.
///
/// # Example
///
/// ```
/// use convoy_coordination::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::default()
///     .with_max_retries(3)
///     .with_initial_interval(Duration::from_millis(10));
///
/// assert!(policy.has_retries_remaining(2));
/// assert!(!policy.has_retries_remaining(3));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0)
    ///
    /// Colliding writers would otherwise retry in lockstep.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(250),
            backoff_coefficient: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// A policy that gives up on the first conflict
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1-based)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }

        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether another retry is allowed after `retries_done` retries
    pub fn has_retries_remaining(&self, retries_done: u32) -> bool {
        retries_done < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_interval, Duration::from_millis(5));
    }

    #[test]
    fn test_delay_doubles_without_jitter() {
        let policy = RetryPolicy::default().with_jitter(0.0);

        assert_eq!(policy.delay_for_retry(0), Duration::ZERO);
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(5));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(10));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(20));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::default()
            .with_jitter(0.0)
            .with_max_interval(Duration::from_millis(30));

        assert_eq!(policy.delay_for_retry(10), Duration::from_millis(30));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let policy = RetryPolicy::default().with_jitter(0.5);
        for _ in 0..100 {
            let delay = policy.delay_for_retry(2);
            assert!(delay >= Duration::from_millis(5));
            assert!(delay <= Duration::from_millis(15));
        }
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.has_retries_remaining(0));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::default().with_max_retries(9);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
