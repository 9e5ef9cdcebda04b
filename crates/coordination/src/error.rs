//! Errors surfaced by the coordination primitives

use uuid::Uuid;

use crate::persistence::StoreError;

/// Result alias for coordination operations
pub type Result<T, E = CoordinationError> = std::result::Result<T, E>;

/// Errors returned by the constraint engine, barrier coordinator and
/// idempotency manager
#[derive(Debug, thiserror::Error)]
pub enum CoordinationError {
    /// No capacity became free within the wait budget
    #[error("no capacity on constraint {constraint_id} for instance {instance_id} within the wait budget")]
    CapacityUnavailable { constraint_id: Uuid, instance_id: Uuid },

    /// Resource constraint not found
    #[error("resource constraint not found: {0}")]
    ConstraintNotFound(Uuid),

    /// The instance was reaped or its lease ran out
    #[error("constraint instance {0} expired")]
    InstanceExpired(Uuid),

    /// The barrier was reaped or its TTL passed before everybody arrived
    #[error("barrier {name} for execution {execution_id} expired")]
    BarrierExpired { name: String, execution_id: String },

    /// The tentative record was reaped or taken over by another caller
    #[error("idempotency fingerprint {0} expired or was taken over")]
    FingerprintExpired(String),

    /// Optimistic concurrency kept losing after the bounded retries
    #[error("concurrent modification of constraint {constraint_id} after {attempts} attempts")]
    ConcurrentModificationConflict { constraint_id: Uuid, attempts: u32 },

    /// Another caller still holds the fingerprint after the lock timeout
    #[error("idempotent operation {0} is still in progress")]
    OperationInProgress(String),

    #[error("permits {requested} outside 1..={capacity}")]
    InvalidPermits { requested: u32, capacity: u32 },

    #[error("capacity {0} outside 1..=1000")]
    InvalidCapacity(u32),

    #[error("resource constraint {name} already exists in account {account_id}")]
    DuplicateConstraint { account_id: String, name: String },

    #[error("workflow {workflow_id} is not a participant of barrier {name} for execution {execution_id}")]
    UnknownParticipant {
        name: String,
        execution_id: String,
        workflow_id: String,
    },

    #[error("barrier {0} declared without participants")]
    EmptyBarrier(String),

    /// Arrivals are recorded per workflow id, so each may appear once
    #[error("workflow {workflow_id} listed twice for barrier {name}")]
    DuplicateParticipant { name: String, workflow_id: String },

    /// The caller's cancellation token fired during a wait
    #[error("wait cancelled")]
    Cancelled,

    /// Store failure
    #[error("store error: {0}")]
    Store(StoreError),
}

impl CoordinationError {
    /// Whether retrying the same call later may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::CapacityUnavailable { .. }
            | Self::ConcurrentModificationConflict { .. }
            | Self::OperationInProgress(_) => true,
            Self::Store(StoreError::Database(_)) => true,
            Self::Store(StoreError::ConcurrencyConflict { .. }) => true,
            _ => false,
        }
    }
}

impl From<StoreError> for CoordinationError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ConstraintNotFound(id) => Self::ConstraintNotFound(id),
            StoreError::DuplicateConstraint { account_id, name } => {
                Self::DuplicateConstraint { account_id, name }
            }
            other => Self::Store(other),
        }
    }
}
