//! # Convoy Coordination
//!
//! Distributed coordination primitives for a continuous-delivery platform,
//! shared by every pipeline and workflow executor in a cluster.
//!
//! ## Features
//!
//! - **Resource constraints**: bounded-capacity permits per resource unit with
//!   FIFO or ASAP queueing and orphan reclamation
//! - **Barriers**: join points for parallel branches of one pipeline execution
//! - **Idempotency**: at-most-once execution of side effects keyed by fingerprint
//! - **Rollback advice**: next-transition decisions for failed canary phases
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐ ┌──────────────────┐ ┌──────────────────┐
//! │ ConstraintEngine │ │BarrierCoordinator│ │IdempotencyManager│
//! └──────────────────┘ └──────────────────┘ └──────────────────┘
//!           │                    │                    │
//!           ▼                    ▼                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CoordinationStore                         │
//! │  (PostgreSQL or in-memory; conditional updates + uniqueness) │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!                              │ periodic sweep
//!                        ┌──────────┐
//!                        │  Reaper  │
//!                        └──────────┘
//!
//! RollbackAdvisor ──► WorkflowLookup (read-only workflow configuration)
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use convoy_coordination::prelude::*;
//!
//! let store = Arc::new(InMemoryCoordinationStore::new());
//! let engine = ConstraintEngine::new(store, CoordinationConfig::default());
//!
//! let constraint = engine
//!     .create_constraint(&Actor::new("ops"), "acct", "prod-db", 1, ConstraintStrategy::Fifo)
//!     .await?;
//! let request = AcquireRequest::new("db-1", Holder::workflow("wf-exec-1"));
//! let result = engine.acquire(constraint.id, request).await?;
//! if !result.granted {
//!     engine.wait_for_grant(result.instance_id, &cancel).await?;
//! }
//! // ... critical section
//! engine.release(result.instance_id).await?;
//! ```

pub mod advisor;
pub mod barrier;
pub mod config;
pub mod constraint;
pub mod error;
pub mod idempotency;
pub mod persistence;
pub mod reaper;
pub mod reliability;

/// Prelude for common imports
pub mod prelude {
    pub use crate::advisor::{
        Decision, ExecutionEvent, ExecutionStatus, InMemoryWorkflowLookup, RollbackAdvisor,
        StateNode, WorkflowLookup,
    };
    pub use crate::barrier::BarrierCoordinator;
    pub use crate::config::CoordinationConfig;
    pub use crate::constraint::{
        AcquireRequest, AcquireResult, ActiveScope, Actor, ConstraintEngine, Holder,
    };
    pub use crate::error::{CoordinationError, Result};
    pub use crate::idempotency::{Begin, IdempotencyManager, IdempotentOutcome};
    pub use crate::persistence::{
        BarrierParticipant, ConstraintStrategy, CoordinationStore, HoldingScope,
        InMemoryCoordinationStore, InstanceState, PostgresCoordinationStore, StoreError,
    };
    pub use crate::reaper::Reaper;

    pub use std::sync::Arc;
    pub use tokio_util::sync::CancellationToken;
}

pub use advisor::{AdvisorError, Decision, RollbackAdvisor};
pub use barrier::BarrierCoordinator;
pub use config::CoordinationConfig;
pub use constraint::ConstraintEngine;
pub use error::{CoordinationError, Result};
pub use idempotency::{IdempotencyManager, IdempotencyToken};
pub use persistence::{CoordinationStore, InMemoryCoordinationStore, PostgresCoordinationStore};
pub use reaper::Reaper;
pub use reliability::{PollConfig, RetryPolicy};
