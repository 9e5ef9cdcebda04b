//! In-memory implementation of CoordinationStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::records::*;
use super::store::*;

/// Constraint row with its queue bookkeeping
struct ConstraintRow {
    constraint: ResourceConstraint,
    next_order: i64,
    version: i64,
}

/// In-memory implementation of CoordinationStore
///
/// Provides the same semantics as the PostgreSQL implementation. Locks are
/// always taken constraints first, then instances, so multi-map updates stay
/// atomic without deadlocks.
///
/// # Example
///
/// ```
/// use convoy_coordination::InMemoryCoordinationStore;
///
/// let store = InMemoryCoordinationStore::new();
/// assert_eq!(store.instance_count(), 0);
/// ```
pub struct InMemoryCoordinationStore {
    constraints: RwLock<HashMap<Uuid, ConstraintRow>>,
    instances: RwLock<HashMap<Uuid, ResourceConstraintInstance>>,
    barriers: RwLock<HashMap<(String, String), BarrierInstance>>,
    idempotent: RwLock<HashMap<String, IdempotentRecord>>,
}

impl InMemoryCoordinationStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            constraints: RwLock::new(HashMap::new()),
            instances: RwLock::new(HashMap::new()),
            barriers: RwLock::new(HashMap::new()),
            idempotent: RwLock::new(HashMap::new()),
        }
    }

    /// Number of constraint instances, finished ones included
    pub fn instance_count(&self) -> usize {
        self.instances.read().len()
    }

    /// Number of barriers
    pub fn barrier_count(&self) -> usize {
        self.barriers.read().len()
    }

    /// Number of idempotent records
    pub fn idempotent_count(&self) -> usize {
        self.idempotent.read().len()
    }

    /// Overwrite an instance's lease (for testing expiry)
    pub fn set_instance_valid_until(&self, id: Uuid, valid_until: DateTime<Utc>) -> bool {
        match self.instances.write().get_mut(&id) {
            Some(instance) => {
                instance.valid_until = valid_until;
                true
            }
            None => false,
        }
    }

    /// Overwrite a barrier's TTL (for testing expiry)
    pub fn set_barrier_valid_until(
        &self,
        name: &str,
        execution_id: &str,
        valid_until: DateTime<Utc>,
    ) -> bool {
        let key = (name.to_string(), execution_id.to_string());
        match self.barriers.write().get_mut(&key) {
            Some(barrier) => {
                barrier.valid_until = valid_until;
                true
            }
            None => false,
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.constraints.write().clear();
        self.instances.write().clear();
        self.barriers.write().clear();
        self.idempotent.write().clear();
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn create_constraint(
        &self,
        constraint: NewResourceConstraint,
    ) -> Result<ResourceConstraint, StoreError> {
        let mut constraints = self.constraints.write();

        let duplicate = constraints.values().any(|row| {
            row.constraint.account_id == constraint.account_id
                && row.constraint.name == constraint.name
        });
        if duplicate {
            return Err(StoreError::DuplicateConstraint {
                account_id: constraint.account_id,
                name: constraint.name,
            });
        }

        let now = Utc::now();
        let created = ResourceConstraint {
            id: Uuid::now_v7(),
            account_id: constraint.account_id,
            name: constraint.name,
            capacity: constraint.capacity,
            strategy: constraint.strategy,
            created_by: constraint.created_by,
            created_at: now,
            updated_at: now,
        };
        constraints.insert(
            created.id,
            ConstraintRow {
                constraint: created.clone(),
                next_order: 1,
                version: 0,
            },
        );
        Ok(created)
    }

    async fn get_constraint(&self, id: Uuid) -> Result<ResourceConstraint, StoreError> {
        self.constraints
            .read()
            .get(&id)
            .map(|row| row.constraint.clone())
            .ok_or(StoreError::ConstraintNotFound(id))
    }

    async fn find_constraint_by_name(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<ResourceConstraint>, StoreError> {
        Ok(self
            .constraints
            .read()
            .values()
            .find(|row| row.constraint.account_id == account_id && row.constraint.name == name)
            .map(|row| row.constraint.clone()))
    }

    async fn update_constraint(
        &self,
        id: Uuid,
        capacity: u32,
        strategy: ConstraintStrategy,
    ) -> Result<ResourceConstraint, StoreError> {
        let mut constraints = self.constraints.write();
        let row = constraints
            .get_mut(&id)
            .ok_or(StoreError::ConstraintNotFound(id))?;

        row.constraint.capacity = capacity;
        row.constraint.strategy = strategy;
        row.constraint.updated_at = Utc::now();
        row.version += 1;
        Ok(row.constraint.clone())
    }

    async fn enqueue_instance(
        &self,
        constraint_id: Uuid,
        instance: NewConstraintInstance,
    ) -> Result<ResourceConstraintInstance, StoreError> {
        let mut constraints = self.constraints.write();
        let row = constraints
            .get_mut(&constraint_id)
            .ok_or(StoreError::ConstraintNotFound(constraint_id))?;

        let order = row.next_order;
        row.next_order += 1;
        row.version += 1;

        let created = ResourceConstraintInstance {
            id: Uuid::now_v7(),
            resource_constraint_id: constraint_id,
            resource_unit: instance.resource_unit,
            order,
            state: InstanceState::Blocked,
            strategy: instance.strategy,
            permits: instance.permits,
            release_entity_type: instance.release_entity_type,
            release_entity_id: instance.release_entity_id,
            acquired_at: None,
            valid_until: instance.valid_until,
            created_at: Utc::now(),
        };
        self.instances.write().insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_instance(
        &self,
        id: Uuid,
    ) -> Result<Option<ResourceConstraintInstance>, StoreError> {
        Ok(self.instances.read().get(&id).cloned())
    }

    async fn load_queue(
        &self,
        constraint_id: Uuid,
        resource_unit: &str,
    ) -> Result<ConstraintQueue, StoreError> {
        let constraints = self.constraints.read();
        let row = constraints
            .get(&constraint_id)
            .ok_or(StoreError::ConstraintNotFound(constraint_id))?;

        let mut instances: Vec<_> = self
            .instances
            .read()
            .values()
            .filter(|i| {
                i.resource_constraint_id == constraint_id
                    && i.resource_unit == resource_unit
                    && i.state != InstanceState::Finished
            })
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.order);

        Ok(ConstraintQueue {
            constraint: row.constraint.clone(),
            version: row.version,
            instances,
        })
    }

    async fn apply_queue_update(
        &self,
        constraint_id: Uuid,
        expected_version: i64,
        update: &QueueUpdate,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let mut constraints = self.constraints.write();
        let row = constraints
            .get_mut(&constraint_id)
            .ok_or(StoreError::ConstraintNotFound(constraint_id))?;

        if row.version != expected_version {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_version,
                actual: row.version,
            });
        }

        let mut instances = self.instances.write();
        for id in &update.finish {
            if let Some(instance) = instances.get_mut(id) {
                instance.state = InstanceState::Finished;
            }
        }
        for id in &update.activate {
            if let Some(instance) = instances.get_mut(id) {
                if instance.state == InstanceState::Blocked {
                    instance.state = InstanceState::Active;
                    instance.acquired_at = Some(now);
                }
            }
        }

        row.version += 1;
        Ok(row.version)
    }

    async fn list_instances(
        &self,
        constraint_id: Uuid,
        resource_unit: Option<&str>,
        states: &[InstanceState],
    ) -> Result<Vec<ResourceConstraintInstance>, StoreError> {
        let mut instances: Vec<_> = self
            .instances
            .read()
            .values()
            .filter(|i| i.resource_constraint_id == constraint_id)
            .filter(|i| resource_unit.map_or(true, |unit| i.resource_unit == unit))
            .filter(|i| states.is_empty() || states.contains(&i.state))
            .cloned()
            .collect();
        instances.sort_by_key(|i| i.order);
        Ok(instances)
    }

    async fn list_instances_for_holder(
        &self,
        scope: HoldingScope,
        entity_id: &str,
    ) -> Result<Vec<ResourceConstraintInstance>, StoreError> {
        let mut instances: Vec<_> = self
            .instances
            .read()
            .values()
            .filter(|i| {
                i.release_entity_type == scope
                    && i.release_entity_id == entity_id
                    && i.state != InstanceState::Finished
            })
            .cloned()
            .collect();
        instances.sort_by_key(|i| (i.resource_constraint_id, i.order));
        Ok(instances)
    }

    async fn insert_barrier(
        &self,
        barrier: BarrierInstance,
    ) -> Result<(BarrierInstance, bool), StoreError> {
        let key = (barrier.name.clone(), barrier.pipeline.execution_id.clone());
        let mut barriers = self.barriers.write();

        if let Some(existing) = barriers.get(&key) {
            if !existing.is_expired(Utc::now()) {
                return Ok((existing.clone(), false));
            }
        }

        barriers.insert(key, barrier.clone());
        Ok((barrier, true))
    }

    async fn get_barrier(
        &self,
        name: &str,
        execution_id: &str,
    ) -> Result<Option<BarrierInstance>, StoreError> {
        let key = (name.to_string(), execution_id.to_string());
        Ok(self.barriers.read().get(&key).cloned())
    }

    async fn check_in_barrier(
        &self,
        name: &str,
        execution_id: &str,
        workflow_id: &str,
        at: DateTime<Utc>,
    ) -> Result<CheckInResult, StoreError> {
        let key = (name.to_string(), execution_id.to_string());
        let mut barriers = self.barriers.write();

        match barriers.get_mut(&key) {
            Some(barrier) if !barrier.is_expired(at) => Ok(barrier.record_arrival(workflow_id, at)),
            _ => Ok(CheckInResult::Missing),
        }
    }

    async fn insert_idempotent(
        &self,
        record: IdempotentRecord,
        now: DateTime<Utc>,
    ) -> Result<IdempotentInsert, StoreError> {
        let mut records = self.idempotent.write();

        if let Some(existing) = records.get(&record.fingerprint) {
            if !existing.is_expired(now) {
                return Ok(IdempotentInsert::Existing(existing.clone()));
            }
        }

        records.insert(record.fingerprint.clone(), record.clone());
        Ok(IdempotentInsert::Inserted(record))
    }

    async fn get_idempotent(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IdempotentRecord>, StoreError> {
        Ok(self.idempotent.read().get(fingerprint).cloned())
    }

    async fn succeed_idempotent(
        &self,
        fingerprint: &str,
        owner: Uuid,
        result: &[serde_json::Value],
        valid_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut records = self.idempotent.write();
        match records.get_mut(fingerprint) {
            Some(record)
                if record.owner == owner
                    && record.state == IdempotentState::Tentative
                    && !record.is_expired(now) =>
            {
                record.state = IdempotentState::Succeeded;
                record.result = result.to_vec();
                record.valid_until = valid_until;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_tentative_idempotent(
        &self,
        fingerprint: &str,
        owner: Uuid,
    ) -> Result<bool, StoreError> {
        let mut records = self.idempotent.write();
        let owned = records
            .get(fingerprint)
            .is_some_and(|r| r.owner == owner && r.state == IdempotentState::Tentative);
        if owned {
            records.remove(fingerprint);
        }
        Ok(owned)
    }

    async fn reap(&self, now: DateTime<Utc>) -> Result<ReapReport, StoreError> {
        let mut report = ReapReport::default();

        // Constraint lock first to keep the lock order of the queue paths
        let mut constraints = self.constraints.write();
        let mut instances = self.instances.write();
        let mut touched = Vec::new();
        instances.retain(|_, i| {
            if i.state == InstanceState::Finished {
                report.finished_instances += 1;
                false
            } else if i.is_expired(now) {
                report.expired_instances += 1;
                touched.push(i.resource_constraint_id);
                false
            } else {
                true
            }
        });
        for id in touched {
            if let Some(row) = constraints.get_mut(&id) {
                row.version += 1;
            }
        }
        drop(instances);
        drop(constraints);

        let mut barriers = self.barriers.write();
        let before = barriers.len();
        barriers.retain(|_, b| !b.is_expired(now));
        report.barriers = (before - barriers.len()) as u64;
        drop(barriers);

        let mut records = self.idempotent.write();
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now));
        report.idempotent_locks = (before - records.len()) as u64;

        Ok(report)
    }
}
