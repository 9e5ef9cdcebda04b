//! CoordinationStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::records::*;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Resource constraint not found
    #[error("resource constraint not found: {0}")]
    ConstraintNotFound(Uuid),

    /// A constraint with this name already exists in the account
    #[error("resource constraint {name} already exists in account {account_id}")]
    DuplicateConstraint { account_id: String, name: String },

    /// Concurrency conflict (optimistic locking failed)
    #[error("concurrency conflict: expected queue version {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Store for constraint queues, barriers and idempotent records
///
/// Every multi-record mutation must be atomic. Constraint queue changes go
/// through [`CoordinationStore::apply_queue_update`], which only commits when
/// the constraint's queue version still matches the snapshot the update was
/// computed from. Implementations must be thread-safe.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    // =========================================================================
    // Resource constraints
    // =========================================================================

    /// Create a new resource constraint
    async fn create_constraint(
        &self,
        constraint: NewResourceConstraint,
    ) -> Result<ResourceConstraint, StoreError>;

    /// Get a constraint by id
    async fn get_constraint(&self, id: Uuid) -> Result<ResourceConstraint, StoreError>;

    /// Find a constraint by its name within an account
    async fn find_constraint_by_name(
        &self,
        account_id: &str,
        name: &str,
    ) -> Result<Option<ResourceConstraint>, StoreError>;

    /// Change capacity and strategy; bumps the queue version
    async fn update_constraint(
        &self,
        id: Uuid,
        capacity: u32,
        strategy: ConstraintStrategy,
    ) -> Result<ResourceConstraint, StoreError>;

    /// Append a blocked instance to the constraint's queue
    ///
    /// The order is drawn from the constraint's counter and the queue version
    /// is bumped in the same atomic step.
    async fn enqueue_instance(
        &self,
        constraint_id: Uuid,
        instance: NewConstraintInstance,
    ) -> Result<ResourceConstraintInstance, StoreError>;

    /// Get an instance by id (None once reaped)
    async fn get_instance(
        &self,
        id: Uuid,
    ) -> Result<Option<ResourceConstraintInstance>, StoreError>;

    /// Snapshot the unfinished instances of one unit with the queue version
    async fn load_queue(
        &self,
        constraint_id: Uuid,
        resource_unit: &str,
    ) -> Result<ConstraintQueue, StoreError>;

    /// Apply a promotion pass if the queue version is still `expected_version`
    ///
    /// Returns the new version, or [`StoreError::ConcurrencyConflict`].
    async fn apply_queue_update(
        &self,
        constraint_id: Uuid,
        expected_version: i64,
        update: &QueueUpdate,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// List instances of a constraint, optionally narrowed by unit and states
    ///
    /// An empty `states` slice matches every state. Sorted by order.
    async fn list_instances(
        &self,
        constraint_id: Uuid,
        resource_unit: Option<&str>,
        states: &[InstanceState],
    ) -> Result<Vec<ResourceConstraintInstance>, StoreError>;

    /// List the unfinished instances held by one execution unit
    async fn list_instances_for_holder(
        &self,
        scope: HoldingScope,
        entity_id: &str,
    ) -> Result<Vec<ResourceConstraintInstance>, StoreError>;

    // =========================================================================
    // Barriers
    // =========================================================================

    /// Insert a barrier unless a live one exists under (name, execution_id)
    ///
    /// Returns the stored barrier and whether it was created by this call.
    /// An expired barrier under the same key is replaced.
    async fn insert_barrier(
        &self,
        barrier: BarrierInstance,
    ) -> Result<(BarrierInstance, bool), StoreError>;

    /// Get a barrier by (name, execution_id)
    async fn get_barrier(
        &self,
        name: &str,
        execution_id: &str,
    ) -> Result<Option<BarrierInstance>, StoreError>;

    /// Atomically record a participant's arrival
    async fn check_in_barrier(
        &self,
        name: &str,
        execution_id: &str,
        workflow_id: &str,
        at: DateTime<Utc>,
    ) -> Result<CheckInResult, StoreError>;

    // =========================================================================
    // Idempotent records
    // =========================================================================

    /// Insert a tentative record unless a live one holds the fingerprint
    ///
    /// Expired records (by `valid_until` against `now`) are replaced.
    async fn insert_idempotent(
        &self,
        record: IdempotentRecord,
        now: DateTime<Utc>,
    ) -> Result<IdempotentInsert, StoreError>;

    /// Get a record by fingerprint
    async fn get_idempotent(
        &self,
        fingerprint: &str,
    ) -> Result<Option<IdempotentRecord>, StoreError>;

    /// Mark a tentative record owned by `owner` as succeeded
    ///
    /// Returns false when the record is gone, expired, or owned by someone else.
    async fn succeed_idempotent(
        &self,
        fingerprint: &str,
        owner: Uuid,
        result: &[serde_json::Value],
        valid_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Delete a tentative record owned by `owner`
    async fn delete_tentative_idempotent(
        &self,
        fingerprint: &str,
        owner: Uuid,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Retention
    // =========================================================================

    /// Delete finished instances and every record whose TTL passed at `now`
    async fn reap(&self, now: DateTime<Utc>) -> Result<ReapReport, StoreError>;
}
