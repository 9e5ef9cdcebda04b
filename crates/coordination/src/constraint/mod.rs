//! Resource constraints: capacity-bounded distributed semaphores
//!
//! ```text
//!  acquire ──► enqueue (Blocked, next order) ──┐
//!                                             ▼
//!  release ──────────────────────────► promotion pass ──► Active
//!  poll / wait_for_grant ─────────────►  (plan + CAS)  ──► Finished
//! ```
//!
//! Capacity applies per resource unit. The sum of permits over active
//! instances of a unit never exceeds the constraint's capacity.

mod engine;
mod plan;

pub use engine::{AcquireRequest, AcquireResult, ActiveScope, Actor, ConstraintEngine, Holder};
pub use plan::{active_after, plan_promotions};
