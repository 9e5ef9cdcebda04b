//! Barrier coordination for parallel branches of one pipeline execution

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::{deadline, CoordinationConfig};
use crate::error::{CoordinationError, Result};
use crate::persistence::{
    BarrierInstance, BarrierParticipant, BarrierPipeline, BarrierState, CheckInResult,
    CoordinationStore,
};
use crate::reliability::Backoff;

/// Declares barriers, records arrivals, and waits for them to go down
///
/// A barrier is keyed by `(name, execution_id)` and goes down once every
/// declared participant has checked in.
#[derive(Clone)]
pub struct BarrierCoordinator {
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
}

impl BarrierCoordinator {
    pub fn new(store: Arc<dyn CoordinationStore>, config: CoordinationConfig) -> Self {
        Self { store, config }
    }

    /// Create the barrier, or return the live one under the same key
    #[instrument(skip(self, participants), fields(participants = participants.len()))]
    pub async fn declare(
        &self,
        app_id: &str,
        name: &str,
        execution_id: &str,
        participants: Vec<BarrierParticipant>,
    ) -> Result<BarrierInstance> {
        if participants.is_empty() {
            return Err(CoordinationError::EmptyBarrier(name.to_string()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = participants.iter().find(|p| !seen.insert(p.workflow_id.as_str())) {
            return Err(CoordinationError::DuplicateParticipant {
                name: name.to_string(),
                workflow_id: dup.workflow_id.clone(),
            });
        }

        let now = Utc::now();
        let workflows = participants
            .into_iter()
            .map(|p| BarrierParticipant {
                arrived_at: None,
                ..p
            })
            .collect();
        let barrier = BarrierInstance {
            id: Uuid::now_v7(),
            app_id: app_id.to_string(),
            name: name.to_string(),
            state: BarrierState::Standing,
            pipeline: BarrierPipeline {
                execution_id: execution_id.to_string(),
                workflows,
            },
            valid_until: deadline(now, self.config.barrier_ttl),
            created_at: now,
            updated_at: now,
        };

        let (barrier, created) = self.store.insert_barrier(barrier).await?;
        if created {
            info!(barrier_id = %barrier.id, "Declared barrier");
        } else {
            debug!(barrier_id = %barrier.id, "barrier already declared");
        }
        Ok(barrier)
    }

    /// Mark `workflow_id` as arrived; returns whether the barrier is down
    #[instrument(skip(self))]
    pub async fn check_in(&self, name: &str, execution_id: &str, workflow_id: &str) -> Result<bool> {
        match self
            .store
            .check_in_barrier(name, execution_id, workflow_id, Utc::now())
            .await?
        {
            CheckInResult::Recorded { is_down, changed } => {
                if changed && is_down {
                    info!("Barrier down");
                }
                Ok(is_down)
            }
            CheckInResult::UnknownParticipant => Err(CoordinationError::UnknownParticipant {
                name: name.to_string(),
                execution_id: execution_id.to_string(),
                workflow_id: workflow_id.to_string(),
            }),
            CheckInResult::Missing => Err(expired(name, execution_id)),
        }
    }

    /// Whether every participant has arrived
    pub async fn is_down(&self, name: &str, execution_id: &str) -> Result<bool> {
        match self.store.get_barrier(name, execution_id).await? {
            Some(barrier) if barrier.is_down() => Ok(true),
            Some(barrier) if !barrier.is_expired(Utc::now()) => Ok(false),
            _ => Err(expired(name, execution_id)),
        }
    }

    /// The barrier as stored, if it is still live
    pub async fn barrier(&self, name: &str, execution_id: &str) -> Result<Option<BarrierInstance>> {
        Ok(self
            .store
            .get_barrier(name, execution_id)
            .await?
            .filter(|b| !b.is_expired(Utc::now())))
    }

    /// Wait with backoff until the barrier is down
    ///
    /// Returns immediately if it already is. A barrier that vanishes or
    /// outlives its TTL while standing fails with `BarrierExpired`.
    #[instrument(skip(self, cancel))]
    pub async fn await_down(
        &self,
        name: &str,
        execution_id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut backoff = Backoff::new(self.config.wait.clone());

        loop {
            if self.is_down(name, execution_id).await? {
                return Ok(());
            }
            if backoff.wait(cancel, None).await {
                return Err(CoordinationError::Cancelled);
            }
        }
    }
}

fn expired(name: &str, execution_id: &str) -> CoordinationError {
    CoordinationError::BarrierExpired {
        name: name.to_string(),
        execution_id: execution_id.to_string(),
    }
}
