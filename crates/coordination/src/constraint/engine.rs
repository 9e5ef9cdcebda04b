//! Resource constraint engine

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::plan::{active_after, plan_promotions};
use crate::config::{deadline, CoordinationConfig};
use crate::error::{CoordinationError, Result};
use crate::persistence::{
    ConstraintStrategy, CoordinationStore, HoldingScope, InstanceState, NewConstraintInstance,
    NewResourceConstraint, ResourceConstraint, ResourceConstraintInstance, StoreError,
    MAX_CONSTRAINT_CAPACITY,
};
use crate::reliability::Backoff;

/// The user or system principal performing an administrative call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: String,
}

impl Actor {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// Execution unit that will hold the permits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holder {
    pub scope: HoldingScope,
    pub entity_id: String,
}

impl Holder {
    pub fn new(scope: HoldingScope, entity_id: impl Into<String>) -> Self {
        Self {
            scope,
            entity_id: entity_id.into(),
        }
    }

    pub fn workflow(entity_id: impl Into<String>) -> Self {
        Self::new(HoldingScope::Workflow, entity_id)
    }

    pub fn phase(entity_id: impl Into<String>) -> Self {
        Self::new(HoldingScope::Phase, entity_id)
    }

    pub fn pipeline(entity_id: impl Into<String>) -> Self {
        Self::new(HoldingScope::Pipeline, entity_id)
    }
}

/// Request for permits on one unit of a constraint
#[derive(Debug, Clone)]
pub struct AcquireRequest {
    pub resource_unit: String,
    pub permits: u32,
    pub holder: Holder,
    /// Promotion strategy for this request; the constraint's when unset
    pub strategy: Option<ConstraintStrategy>,
    /// Lease length; the configured default when unset
    pub lease: Option<Duration>,
}

impl AcquireRequest {
    /// Request one permit
    pub fn new(resource_unit: impl Into<String>, holder: Holder) -> Self {
        Self {
            resource_unit: resource_unit.into(),
            permits: 1,
            holder,
            strategy: None,
            lease: None,
        }
    }

    pub fn with_permits(mut self, permits: u32) -> Self {
        self.permits = permits;
        self
    }

    pub fn with_strategy(mut self, strategy: ConstraintStrategy) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Some(lease);
        self
    }
}

/// Outcome of [`ConstraintEngine::acquire`] and [`ConstraintEngine::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireResult {
    /// Whether the instance holds its permits now
    pub granted: bool,
    pub instance_id: Uuid,
    pub order: i64,
}

/// An active holder, as reported by [`ConstraintEngine::usage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveScope {
    pub instance_id: Uuid,
    pub resource_unit: String,
    pub release_entity_type: HoldingScope,
    pub release_entity_id: String,
    pub permits: u32,
    pub acquired_at: Option<DateTime<Utc>>,
}

impl From<ResourceConstraintInstance> for ActiveScope {
    fn from(instance: ResourceConstraintInstance) -> Self {
        Self {
            instance_id: instance.id,
            resource_unit: instance.resource_unit,
            release_entity_type: instance.release_entity_type,
            release_entity_id: instance.release_entity_id,
            permits: instance.permits,
            acquired_at: instance.acquired_at,
        }
    }
}

/// Grants and releases permits of capacity-bounded resource constraints
///
/// Every queue change is an optimistic pass: snapshot the unit's queue with
/// its version, plan promotions, apply with a compare-and-swap. Losing the
/// race re-runs the pass, so any number of engines may share one store.
#[derive(Clone)]
pub struct ConstraintEngine {
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
}

impl ConstraintEngine {
    pub fn new(store: Arc<dyn CoordinationStore>, config: CoordinationConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    /// Create a constraint; names are unique per account
    #[instrument(skip(self, actor), fields(actor = %actor.id))]
    pub async fn create_constraint(
        &self,
        actor: &Actor,
        account_id: &str,
        name: &str,
        capacity: u32,
        strategy: ConstraintStrategy,
    ) -> Result<ResourceConstraint> {
        validate_capacity(capacity)?;

        let constraint = self
            .store
            .create_constraint(NewResourceConstraint {
                account_id: account_id.to_string(),
                name: name.to_string(),
                capacity,
                strategy,
                created_by: Some(actor.id.clone()),
            })
            .await?;

        info!(constraint_id = %constraint.id, capacity, %strategy, "Created resource constraint");
        Ok(constraint)
    }

    pub async fn constraint(&self, id: Uuid) -> Result<ResourceConstraint> {
        Ok(self.store.get_constraint(id).await?)
    }

    pub async fn constraint_by_name(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<ResourceConstraint>> {
        Ok(self.store.find_constraint_by_name(account_id, name).await?)
    }

    /// Change capacity or strategy, then re-run promotion on waiting units
    #[instrument(skip(self))]
    pub async fn update_constraint(
        &self,
        id: Uuid,
        capacity: u32,
        strategy: ConstraintStrategy,
    ) -> Result<ResourceConstraint> {
        validate_capacity(capacity)?;
        let constraint = self.store.update_constraint(id, capacity, strategy).await?;

        let units: BTreeSet<String> = self
            .store
            .list_instances(id, None, &[InstanceState::Blocked])
            .await?
            .into_iter()
            .map(|i| i.resource_unit)
            .collect();
        for unit in &units {
            self.reevaluate(id, unit, &[]).await?;
        }

        info!(constraint_id = %id, capacity, %strategy, units = units.len(), "Updated resource constraint");
        Ok(constraint)
    }

    /// Enqueue a request and try to grant it right away
    ///
    /// A request that is not granted stays blocked in the queue; follow up
    /// with [`ConstraintEngine::wait_for_grant`] or [`ConstraintEngine::poll`],
    /// and [`ConstraintEngine::release`] it when giving up. A promotion pass
    /// that loses every conflict retry also reports `granted: false`; any
    /// other failure finishes the new instance before the error is returned.
    #[instrument(skip(self, request), fields(resource_unit = %request.resource_unit, permits = request.permits))]
    pub async fn acquire(
        &self,
        constraint_id: Uuid,
        request: AcquireRequest,
    ) -> Result<AcquireResult> {
        let constraint = self.store.get_constraint(constraint_id).await?;
        if request.permits == 0 || request.permits > constraint.capacity {
            return Err(CoordinationError::InvalidPermits {
                requested: request.permits,
                capacity: constraint.capacity,
            });
        }

        let lease = request.lease.unwrap_or(self.config.constraint_lease);
        let instance = self
            .store
            .enqueue_instance(
                constraint_id,
                NewConstraintInstance {
                    resource_unit: request.resource_unit.clone(),
                    strategy: request.strategy.unwrap_or(constraint.strategy),
                    permits: request.permits,
                    release_entity_type: request.holder.scope,
                    release_entity_id: request.holder.entity_id.clone(),
                    valid_until: deadline(Utc::now(), lease),
                },
            )
            .await?;

        // The instance is committed from here on; the caller must get its id
        // back or the row must be finished, never neither.
        let active = match self
            .reevaluate(constraint_id, &request.resource_unit, &[])
            .await
        {
            Ok(active) => active,
            Err(CoordinationError::ConcurrentModificationConflict { attempts, .. }) => {
                warn!(
                    %constraint_id,
                    instance_id = %instance.id,
                    attempts,
                    "Promotion pass contended, instance left queued"
                );
                Vec::new()
            }
            Err(e) => {
                if let Err(retire) = self
                    .reevaluate(constraint_id, &request.resource_unit, &[instance.id])
                    .await
                {
                    warn!(
                        %constraint_id,
                        instance_id = %instance.id,
                        error = %retire,
                        "Failed to retire instance after acquire error"
                    );
                }
                return Err(e);
            }
        };
        let granted = active.contains(&instance.id);

        debug!(
            %constraint_id,
            instance_id = %instance.id,
            order = instance.order,
            granted,
            "acquire"
        );
        Ok(AcquireResult {
            granted,
            instance_id: instance.id,
            order: instance.order,
        })
    }

    /// Run a promotion pass for the instance's unit and report its state
    #[instrument(skip(self))]
    pub async fn poll(&self, instance_id: Uuid) -> Result<AcquireResult> {
        let instance = self.instance(instance_id).await?;
        let granted = match instance.state {
            InstanceState::Active if !instance.is_expired(Utc::now()) => true,
            InstanceState::Finished => {
                return Err(CoordinationError::InstanceExpired(instance_id));
            }
            _ => {
                let active = self
                    .reevaluate(
                        instance.resource_constraint_id,
                        &instance.resource_unit,
                        &[],
                    )
                    .await?;
                if !active.contains(&instance_id) && instance.is_expired(Utc::now()) {
                    return Err(CoordinationError::InstanceExpired(instance_id));
                }
                active.contains(&instance_id)
            }
        };

        Ok(AcquireResult {
            granted,
            instance_id,
            order: instance.order,
        })
    }

    /// Poll with backoff until the instance is active
    ///
    /// Fails with `CapacityUnavailable` once the configured wait budget is
    /// spent and with `Cancelled` when `cancel` fires. The instance stays
    /// queued in both cases.
    #[instrument(skip(self, cancel))]
    pub async fn wait_for_grant(
        &self,
        instance_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<ResourceConstraintInstance> {
        let started = tokio::time::Instant::now();
        let mut backoff = Backoff::new(self.config.wait.clone());

        loop {
            let result = self.poll(instance_id).await?;
            if result.granted {
                return self.instance(instance_id).await;
            }

            let remaining = self.config.wait.max_wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                let instance = self.instance(instance_id).await?;
                warn!(
                    %instance_id,
                    constraint_id = %instance.resource_constraint_id,
                    "Wait budget exhausted while blocked on constraint"
                );
                return Err(CoordinationError::CapacityUnavailable {
                    constraint_id: instance.resource_constraint_id,
                    instance_id,
                });
            }

            if backoff.wait(cancel, Some(remaining)).await {
                return Err(CoordinationError::Cancelled);
            }
        }
    }

    /// Read one instance; reaped instances surface as `InstanceExpired`
    pub async fn instance(&self, instance_id: Uuid) -> Result<ResourceConstraintInstance> {
        self.store
            .get_instance(instance_id)
            .await?
            .ok_or(CoordinationError::InstanceExpired(instance_id))
    }

    /// Give the permits back and promote waiting instances
    ///
    /// Releasing a finished or reaped instance is a no-op.
    #[instrument(skip(self))]
    pub async fn release(&self, instance_id: Uuid) -> Result<()> {
        let Some(instance) = self.store.get_instance(instance_id).await? else {
            debug!(%instance_id, "release of reaped instance ignored");
            return Ok(());
        };
        if instance.state == InstanceState::Finished {
            return Ok(());
        }

        self.reevaluate(
            instance.resource_constraint_id,
            &instance.resource_unit,
            &[instance_id],
        )
        .await?;

        debug!(%instance_id, constraint_id = %instance.resource_constraint_id, "released");
        Ok(())
    }

    /// Release everything an execution unit still holds or waits for
    ///
    /// Returns the number of released instances.
    #[instrument(skip(self))]
    pub async fn release_entity(&self, scope: HoldingScope, entity_id: &str) -> Result<usize> {
        let held = self
            .store
            .list_instances_for_holder(scope, entity_id)
            .await?;

        let mut groups: Vec<((Uuid, String), Vec<Uuid>)> = Vec::new();
        for instance in &held {
            let key = (instance.resource_constraint_id, instance.resource_unit.clone());
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, ids)) => ids.push(instance.id),
                None => groups.push((key, vec![instance.id])),
            }
        }

        for ((constraint_id, unit), ids) in &groups {
            self.reevaluate(*constraint_id, unit, ids).await?;
        }

        if !held.is_empty() {
            info!(%scope, entity_id, released = held.len(), "Released constraint instances of entity");
        }
        Ok(held.len())
    }

    /// Current active holders of a constraint, across all units
    pub async fn usage(&self, constraint_id: Uuid) -> Result<Vec<ActiveScope>> {
        self.store.get_constraint(constraint_id).await?;
        let now = Utc::now();

        Ok(self
            .store
            .list_instances(constraint_id, None, &[InstanceState::Active])
            .await?
            .into_iter()
            .filter(|i| !i.is_expired(now))
            .map(ActiveScope::from)
            .collect())
    }

    /// Instances of one unit in queue order; an empty `states` lists all
    pub async fn instances_for_unit(
        &self,
        constraint_id: Uuid,
        resource_unit: &str,
        states: &[InstanceState],
    ) -> Result<Vec<ResourceConstraintInstance>> {
        Ok(self
            .store
            .list_instances(constraint_id, Some(resource_unit), states)
            .await?)
    }

    /// Optimistic promotion pass over one unit
    ///
    /// Returns the ids of the instances holding permits after the pass.
    async fn reevaluate(
        &self,
        constraint_id: Uuid,
        resource_unit: &str,
        releasing: &[Uuid],
    ) -> Result<Vec<Uuid>> {
        let policy = &self.config.conflict_retry;
        let mut retries = 0;

        loop {
            let queue = self.store.load_queue(constraint_id, resource_unit).await?;
            let now = Utc::now();
            let update = plan_promotions(&queue, now, releasing);
            if update.is_empty() {
                return Ok(active_after(&queue, &update));
            }

            match self
                .store
                .apply_queue_update(constraint_id, queue.version, &update, now)
                .await
            {
                Ok(version) => {
                    debug!(
                        %constraint_id,
                        resource_unit,
                        version,
                        finished = update.finish.len(),
                        activated = update.activate.len(),
                        "promotion pass applied"
                    );
                    return Ok(active_after(&queue, &update));
                }
                Err(StoreError::ConcurrencyConflict { expected, actual }) => {
                    if !policy.has_retries_remaining(retries) {
                        warn!(%constraint_id, attempts = retries + 1, "Gave up on contended queue");
                        return Err(CoordinationError::ConcurrentModificationConflict {
                            constraint_id,
                            attempts: retries + 1,
                        });
                    }
                    retries += 1;
                    debug!(%constraint_id, expected, actual, retries, "queue version moved, retrying");
                    tokio::time::sleep(policy.delay_for_retry(retries)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn validate_capacity(capacity: u32) -> Result<()> {
    if capacity == 0 || capacity > MAX_CONSTRAINT_CAPACITY {
        return Err(CoordinationError::InvalidCapacity(capacity));
    }
    Ok(())
}
