//! Coordination configuration

use std::env;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::reliability::{duration_millis, PollConfig, RetryPolicy};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Tunables shared by the coordination primitives
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CoordinationConfig {
    /// Lease of a constraint instance before it counts as orphaned
    #[serde(with = "duration_millis")]
    pub constraint_lease: Duration,

    /// Lifetime of a barrier
    #[serde(with = "duration_millis")]
    pub barrier_ttl: Duration,

    /// Lifetime of an idempotent record
    #[serde(with = "duration_millis")]
    pub idempotency_ttl: Duration,

    /// How long `begin` waits on an in-flight fingerprint
    #[serde(with = "duration_millis")]
    pub idempotency_lock_timeout: Duration,

    /// Retries after losing a queue-version race
    pub conflict_retry: RetryPolicy,

    /// Poll backoff for blocking waits
    pub wait: PollConfig,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            constraint_lease: DAY * 30,
            barrier_ttl: DAY * 30,
            idempotency_ttl: DAY * 3,
            idempotency_lock_timeout: Duration::from_secs(10),
            conflict_retry: RetryPolicy::default(),
            wait: PollConfig::default(),
        }
    }
}

impl CoordinationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables (durations in milliseconds):
    /// - `CONVOY_CONSTRAINT_LEASE_MS`
    /// - `CONVOY_BARRIER_TTL_MS`
    /// - `CONVOY_IDEMPOTENCY_TTL_MS`
    /// - `CONVOY_IDEMPOTENCY_LOCK_TIMEOUT_MS`
    /// - `CONVOY_MAX_CONFLICT_RETRIES`
    /// - `CONVOY_WAIT_MIN_INTERVAL_MS`
    /// - `CONVOY_WAIT_MAX_INTERVAL_MS`
    /// - `CONVOY_WAIT_MAX_MS`
    ///
    /// Unset or unparsable values fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let wait = PollConfig {
            min_interval: env_millis("CONVOY_WAIT_MIN_INTERVAL_MS")
                .unwrap_or(defaults.wait.min_interval),
            max_interval: env_millis("CONVOY_WAIT_MAX_INTERVAL_MS")
                .unwrap_or(defaults.wait.max_interval),
            max_wait: env_millis("CONVOY_WAIT_MAX_MS").unwrap_or(defaults.wait.max_wait),
            ..defaults.wait
        };

        let max_retries = env::var("CONVOY_MAX_CONFLICT_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.conflict_retry.max_retries);

        Self {
            constraint_lease: env_millis("CONVOY_CONSTRAINT_LEASE_MS")
                .unwrap_or(defaults.constraint_lease),
            barrier_ttl: env_millis("CONVOY_BARRIER_TTL_MS").unwrap_or(defaults.barrier_ttl),
            idempotency_ttl: env_millis("CONVOY_IDEMPOTENCY_TTL_MS")
                .unwrap_or(defaults.idempotency_ttl),
            idempotency_lock_timeout: env_millis("CONVOY_IDEMPOTENCY_LOCK_TIMEOUT_MS")
                .unwrap_or(defaults.idempotency_lock_timeout),
            conflict_retry: defaults.conflict_retry.with_max_retries(max_retries),
            wait,
        }
    }

    pub fn with_constraint_lease(mut self, lease: Duration) -> Self {
        self.constraint_lease = lease;
        self
    }

    pub fn with_barrier_ttl(mut self, ttl: Duration) -> Self {
        self.barrier_ttl = ttl;
        self
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    pub fn with_idempotency_lock_timeout(mut self, timeout: Duration) -> Self {
        self.idempotency_lock_timeout = timeout;
        self
    }

    pub fn with_conflict_retry(mut self, policy: RetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    pub fn with_wait(mut self, wait: PollConfig) -> Self {
        self.wait = wait;
        self
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
}

/// `now + ttl`, saturating instead of overflowing on absurd TTLs
pub(crate) fn deadline(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoordinationConfig::default();
        assert_eq!(config.constraint_lease, Duration::from_secs(30 * 24 * 3600));
        assert_eq!(config.idempotency_ttl, Duration::from_secs(3 * 24 * 3600));
        assert_eq!(config.idempotency_lock_timeout, Duration::from_secs(10));
        assert_eq!(config.conflict_retry.max_retries, 5);
        assert_eq!(config.wait.min_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_serialization_uses_millis() {
        let config = CoordinationConfig::default()
            .with_idempotency_lock_timeout(Duration::from_millis(1500));
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["idempotency_lock_timeout"], 1500);

        let parsed: CoordinationConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_deadline_saturates() {
        let now = Utc::now();
        assert_eq!(
            deadline(now, Duration::from_secs(u64::MAX)),
            DateTime::<Utc>::MAX_UTC
        );
        assert_eq!(deadline(now, Duration::from_secs(60)), now + chrono::Duration::seconds(60));
    }
}
