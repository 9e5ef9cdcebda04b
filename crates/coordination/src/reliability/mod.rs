//! Reliability helpers for the coordination primitives
//!
//! This module provides:
//! - [`RetryPolicy`] - bounded retry for optimistic-concurrency conflicts
//! - [`PollConfig`] / [`Backoff`] - cancellable exponential poll backoff

mod backoff;
mod retry;

pub use backoff::{Backoff, PollConfig};
pub use retry::RetryPolicy;

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
