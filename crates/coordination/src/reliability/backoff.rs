//! Poll backoff for the blocking waits
//!
//! `wait_for_grant`, `await_down` and `begin` all poll the store. None of
//! them spin: each keeps a [`Backoff`] that grows from `min_interval` to
//! `max_interval` and aborts early when the caller's token is cancelled.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollConfig {
    /// First poll interval
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Ceiling for the poll interval
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor applied after every unsuccessful poll
    pub backoff_multiplier: f64,

    /// Total time a constraint grant wait may take
    #[serde(with = "duration_millis")]
    pub max_wait: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            max_wait: Duration::from_secs(60),
        }
    }
}

impl PollConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier (at least 1.0)
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }
}

/// Growing poll interval with cancellable sleeps
#[derive(Debug, Clone)]
pub struct Backoff {
    config: PollConfig,
    current_interval: Duration,
}

impl Backoff {
    pub fn new(config: PollConfig) -> Self {
        let current_interval = config.min_interval;
        Self {
            config,
            current_interval,
        }
    }

    /// Current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Reset to the minimum interval
    pub fn reset(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    /// Grow the interval by the multiplier, capped at `max_interval`
    pub fn increase(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }

    /// Sleep for the current interval (shortened to `limit`), then grow it
    ///
    /// Returns true if `cancel` fired during the sleep.
    pub async fn wait(&mut self, cancel: &CancellationToken, limit: Option<Duration>) -> bool {
        let delay = match limit {
            Some(limit) => self.current_interval.min(limit),
            None => self.current_interval,
        };
        trace!(interval_ms = delay.as_millis() as u64, "backing off");

        let cancelled = tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = cancel.cancelled() => {
                debug!("Cancellation received during backoff");
                true
            }
        };

        self.increase();
        cancelled
    }
}
