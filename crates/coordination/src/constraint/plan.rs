//! Promotion planning
//!
//! A pass over one unit's queue snapshot decides which instances finish
//! (released, or lease ran out) and which blocked instances become active.
//! The planner is pure; the engine applies its output with a CAS on the
//! queue version and re-plans on conflict.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::persistence::{ConstraintQueue, ConstraintStrategy, InstanceState, QueueUpdate};

/// Plan one promotion pass
///
/// `releasing` lists instances the caller is giving back. Expired instances
/// are retired as if released. Active permits never exceed the capacity
/// after the plan; if an administrative edit lowered the capacity below the
/// current usage, nothing is promoted until enough holders leave.
///
/// Blocked instances are visited in `order`. Once one of them does not fit,
/// later `Fifo` instances stay blocked behind it; `Asap` instances that fit
/// are still promoted.
pub fn plan_promotions(
    queue: &ConstraintQueue,
    now: DateTime<Utc>,
    releasing: &[Uuid],
) -> QueueUpdate {
    let capacity = u64::from(queue.constraint.capacity);
    let mut update = QueueUpdate::default();
    let mut in_use: u64 = 0;

    let retiring = |id: &Uuid, expired: bool| expired || releasing.contains(id);

    for instance in queue
        .instances
        .iter()
        .filter(|i| i.state == InstanceState::Active)
    {
        if retiring(&instance.id, instance.is_expired(now)) {
            update.finish.push(instance.id);
        } else {
            in_use += u64::from(instance.permits);
        }
    }

    let mut head_blocked = false;
    for instance in queue
        .instances
        .iter()
        .filter(|i| i.state == InstanceState::Blocked)
    {
        if retiring(&instance.id, instance.is_expired(now)) {
            update.finish.push(instance.id);
            continue;
        }

        if head_blocked && instance.strategy == ConstraintStrategy::Fifo {
            continue;
        }

        let permits = u64::from(instance.permits);
        if in_use + permits <= capacity {
            update.activate.push(instance.id);
            in_use += permits;
        } else {
            head_blocked = true;
        }
    }

    update
}

/// Ids of the instances that hold permits once `update` is applied
pub fn active_after(queue: &ConstraintQueue, update: &QueueUpdate) -> Vec<Uuid> {
    queue
        .instances
        .iter()
        .filter(|i| i.state == InstanceState::Active && !update.finish.contains(&i.id))
        .map(|i| i.id)
        .chain(update.activate.iter().copied())
        .collect()
}
