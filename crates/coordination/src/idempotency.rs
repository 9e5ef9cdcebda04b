//! Fingerprint-based dedup for side-effecting operations
//!
//! A caller inserts a tentative record for the fingerprint, performs the
//! operation, then stores the result. Concurrent or retried callers with the
//! same fingerprint either wait for the first one or read its cached result.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{deadline, CoordinationConfig};
use crate::error::{CoordinationError, Result};
use crate::persistence::{CoordinationStore, IdempotentInsert, IdempotentRecord, IdempotentState};
use crate::reliability::Backoff;

/// Proof of ownership of a tentative record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyToken {
    fingerprint: String,
    owner: Uuid,
}

impl IdempotencyToken {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Outcome of one non-blocking attempt
#[derive(Debug, Clone, PartialEq)]
pub enum Begin {
    /// The operation already ran; here is its result
    AlreadySucceeded(Vec<Value>),

    /// Another caller is running the operation
    InProgress,

    /// This caller owns the fingerprint and must run the operation
    Started(IdempotencyToken),
}

/// Outcome of [`IdempotencyManager::begin`]
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotentOutcome {
    AlreadySucceeded(Vec<Value>),
    Started(IdempotencyToken),
}

/// Guards operations so each fingerprint executes at most once per TTL
#[derive(Clone)]
pub struct IdempotencyManager {
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
}

impl IdempotencyManager {
    pub fn new(store: Arc<dyn CoordinationStore>, config: CoordinationConfig) -> Self {
        Self { store, config }
    }

    /// Claim the fingerprint once, without waiting
    #[instrument(skip(self))]
    pub async fn try_begin(&self, fingerprint: &str) -> Result<Begin> {
        let now = Utc::now();
        let owner = Uuid::now_v7();
        let record = IdempotentRecord::tentative(
            fingerprint,
            owner,
            deadline(now, self.config.idempotency_ttl),
        );

        match self.store.insert_idempotent(record, now).await? {
            IdempotentInsert::Inserted(_) => {
                debug!(%owner, "started idempotent operation");
                Ok(Begin::Started(IdempotencyToken {
                    fingerprint: fingerprint.to_string(),
                    owner,
                }))
            }
            IdempotentInsert::Existing(existing) => match existing.state {
                IdempotentState::Succeeded => Ok(Begin::AlreadySucceeded(existing.result)),
                IdempotentState::Tentative => Ok(Begin::InProgress),
            },
        }
    }

    /// Claim the fingerprint, waiting out an in-flight owner
    ///
    /// Gives up with `OperationInProgress` after the configured lock timeout.
    #[instrument(skip(self))]
    pub async fn begin(&self, fingerprint: &str) -> Result<IdempotentOutcome> {
        let started = tokio::time::Instant::now();
        let timeout = self.config.idempotency_lock_timeout;
        let mut backoff = Backoff::new(self.config.wait.clone());
        // Waits here are bounded by the lock timeout only
        let never = CancellationToken::new();

        loop {
            match self.try_begin(fingerprint).await? {
                Begin::AlreadySucceeded(result) => {
                    return Ok(IdempotentOutcome::AlreadySucceeded(result))
                }
                Begin::Started(token) => return Ok(IdempotentOutcome::Started(token)),
                Begin::InProgress => {}
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                warn!("Idempotent operation still in progress after lock timeout");
                return Err(CoordinationError::OperationInProgress(
                    fingerprint.to_string(),
                ));
            }
            backoff.wait(&never, Some(remaining)).await;
        }
    }

    /// Store the result and make the record immutable until its TTL
    #[instrument(skip(self, token, result), fields(fingerprint = %token.fingerprint))]
    pub async fn complete(&self, token: IdempotencyToken, result: Vec<Value>) -> Result<()> {
        let now = Utc::now();
        let stored = self
            .store
            .succeed_idempotent(
                &token.fingerprint,
                token.owner,
                &result,
                deadline(now, self.config.idempotency_ttl),
                now,
            )
            .await?;

        if !stored {
            return Err(CoordinationError::FingerprintExpired(token.fingerprint));
        }
        debug!("completed idempotent operation");
        Ok(())
    }

    /// Drop the tentative record so a later retry can run the operation
    #[instrument(skip(self, token), fields(fingerprint = %token.fingerprint))]
    pub async fn abandon(&self, token: IdempotencyToken) -> Result<()> {
        let deleted = self
            .store
            .delete_tentative_idempotent(&token.fingerprint, token.owner)
            .await?;
        if !deleted {
            debug!("abandoned record was already gone");
        }
        Ok(())
    }

    /// Run `operation` at most once for `fingerprint`
    ///
    /// Returns the cached result when the fingerprint already succeeded.
    /// The record is completed on success and abandoned on failure.
    #[instrument(skip(self, operation))]
    pub async fn run<F, Fut, E>(&self, fingerprint: &str, operation: F) -> Result<Vec<Value>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Value>, E>>,
        E: From<CoordinationError>,
    {
        let token = match self.begin(fingerprint).await? {
            IdempotentOutcome::AlreadySucceeded(result) => {
                debug!("returning cached result");
                return Ok(result);
            }
            IdempotentOutcome::Started(token) => token,
        };

        match operation().await {
            Ok(result) => {
                if let Err(e) = self.complete(token, result.clone()).await {
                    error!(error = %e, "Operation succeeded but its result could not be recorded");
                    return Err(e.into());
                }
                info!("Idempotent operation executed");
                Ok(result)
            }
            Err(e) => {
                if let Err(abandon_err) = self.abandon(token).await {
                    warn!(error = %abandon_err, "Failed to abandon idempotent record");
                }
                Err(e)
            }
        }
    }
}
