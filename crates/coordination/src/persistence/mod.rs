//! Persistence layer for coordination state
//!
//! This module provides:
//! - [`CoordinationStore`] trait for constraint queues, barriers and idempotent records
//! - [`InMemoryCoordinationStore`] for testing and single-process embedding
//! - [`PostgresCoordinationStore`] for production

mod memory;
mod postgres;
mod records;
mod store;

pub use memory::InMemoryCoordinationStore;
pub use postgres::PostgresCoordinationStore;
pub use records::{
    BarrierInstance, BarrierParticipant, BarrierPipeline, BarrierState, CheckInResult,
    ConstraintQueue, ConstraintStrategy, HoldingScope, IdempotentInsert, IdempotentRecord,
    IdempotentState, InstanceState, NewConstraintInstance, NewResourceConstraint, QueueUpdate,
    ReapReport, ResourceConstraint, ResourceConstraintInstance, MAX_CONSTRAINT_CAPACITY,
};
pub use store::{CoordinationStore, StoreError};
