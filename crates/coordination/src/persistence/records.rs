//! Records kept in the coordination store

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::store::StoreError;

/// Largest capacity a resource constraint may declare
pub const MAX_CONSTRAINT_CAPACITY: u32 = 1000;

/// Ordering policy used when promoting blocked instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintStrategy {
    /// Strict queue order: nothing is promoted past a blocked predecessor
    Fifo,

    /// Best effort: a blocked instance that does not fit is skipped
    Asap,
}

impl std::fmt::Display for ConstraintStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fifo => write!(f, "fifo"),
            Self::Asap => write!(f, "asap"),
        }
    }
}

impl FromStr for ConstraintStrategy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fifo" => Ok(Self::Fifo),
            "asap" => Ok(Self::Asap),
            other => Err(StoreError::Database(format!(
                "unknown constraint strategy: {}",
                other
            ))),
        }
    }
}

/// A named, capacity-bounded distributed semaphore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConstraint {
    pub id: Uuid,
    pub account_id: String,
    pub name: String,
    pub capacity: u32,
    pub strategy: ConstraintStrategy,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a resource constraint
#[derive(Debug, Clone)]
pub struct NewResourceConstraint {
    pub account_id: String,
    pub name: String,
    pub capacity: u32,
    pub strategy: ConstraintStrategy,
    pub created_by: Option<String>,
}

/// Lifecycle of one acquisition request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Waiting for capacity
    Blocked,

    /// Holding its permits
    Active,

    /// Released, or force-expired after its lease
    Finished,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocked => write!(f, "blocked"),
            Self::Active => write!(f, "active"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

impl FromStr for InstanceState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blocked" => Ok(Self::Blocked),
            "active" => Ok(Self::Active),
            "finished" => Ok(Self::Finished),
            other => Err(StoreError::Database(format!(
                "unknown instance state: {}",
                other
            ))),
        }
    }
}

/// Kind of execution unit that holds a permit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldingScope {
    Workflow,
    Phase,
    Pipeline,
}

impl std::fmt::Display for HoldingScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Workflow => write!(f, "workflow"),
            Self::Phase => write!(f, "phase"),
            Self::Pipeline => write!(f, "pipeline"),
        }
    }
}

impl FromStr for HoldingScope {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "workflow" => Ok(Self::Workflow),
            "phase" => Ok(Self::Phase),
            "pipeline" => Ok(Self::Pipeline),
            other => Err(StoreError::Database(format!(
                "unknown holding scope: {}",
                other
            ))),
        }
    }
}

/// One request to hold permits of a constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConstraintInstance {
    pub id: Uuid,
    pub resource_constraint_id: Uuid,
    /// Resource partition the capacity applies to (e.g. an infrastructure id)
    pub resource_unit: String,
    /// Queue position, strictly increasing per constraint and never reused
    pub order: i64,
    pub state: InstanceState,
    pub strategy: ConstraintStrategy,
    pub permits: u32,
    pub release_entity_type: HoldingScope,
    pub release_entity_id: String,
    pub acquired_at: Option<DateTime<Utc>>,
    pub valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ResourceConstraintInstance {
    /// Whether the lease has run out at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until <= now
    }
}

/// Input for enqueuing a constraint instance
#[derive(Debug, Clone)]
pub struct NewConstraintInstance {
    pub resource_unit: String,
    pub strategy: ConstraintStrategy,
    pub permits: u32,
    pub release_entity_type: HoldingScope,
    pub release_entity_id: String,
    pub valid_until: DateTime<Utc>,
}

/// Snapshot of the unfinished instances of one constraint unit
///
/// `version` is the constraint's queue version at the time of the read. Any
/// change to the queue bumps it, so a [`QueueUpdate`] computed from this
/// snapshot can be applied with a compare-and-swap on the version.
#[derive(Debug, Clone)]
pub struct ConstraintQueue {
    pub constraint: ResourceConstraint,
    pub version: i64,
    /// Blocked and active instances of the unit, ascending by `order`
    pub instances: Vec<ResourceConstraintInstance>,
}

/// State changes computed by one promotion pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueUpdate {
    /// Instances to mark finished (released or lease expired)
    pub finish: Vec<Uuid>,

    /// Blocked instances to promote to active
    pub activate: Vec<Uuid>,
}

impl QueueUpdate {
    pub fn is_empty(&self) -> bool {
        self.finish.is_empty() && self.activate.is_empty()
    }
}

/// Barrier lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierState {
    /// Waiting for participants
    Standing,

    /// Every participant has arrived
    Down,
}

impl std::fmt::Display for BarrierState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standing => write!(f, "standing"),
            Self::Down => write!(f, "down"),
        }
    }
}

impl FromStr for BarrierState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standing" => Ok(Self::Standing),
            "down" => Ok(Self::Down),
            other => Err(StoreError::Database(format!(
                "unknown barrier state: {}",
                other
            ))),
        }
    }
}

/// A workflow branch expected at a barrier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierParticipant {
    pub workflow_id: String,
    #[serde(default)]
    pub phase_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub arrived_at: Option<DateTime<Utc>>,
}

impl BarrierParticipant {
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            phase_id: None,
            step_id: None,
            arrived_at: None,
        }
    }

    pub fn with_phase(mut self, phase_id: impl Into<String>) -> Self {
        self.phase_id = Some(phase_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn has_arrived(&self) -> bool {
        self.arrived_at.is_some()
    }
}

/// The pipeline execution a barrier belongs to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierPipeline {
    pub execution_id: String,
    pub workflows: Vec<BarrierParticipant>,
}

/// Rendezvous point for the parallel branches of one pipeline execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierInstance {
    pub id: Uuid,
    pub app_id: String,
    pub name: String,
    pub state: BarrierState,
    pub pipeline: BarrierPipeline,
    pub valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BarrierInstance {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until <= now
    }

    pub fn is_down(&self) -> bool {
        self.state == BarrierState::Down
    }

    /// Participants that have not checked in yet
    pub fn missing(&self) -> impl Iterator<Item = &BarrierParticipant> {
        self.pipeline.workflows.iter().filter(|w| !w.has_arrived())
    }

    /// Record the arrival of `workflow_id`
    ///
    /// Both stores run this inside their atomic section. Arrivals commute:
    /// the barrier goes down when the last missing participant arrives,
    /// whatever the order, and repeated arrivals change nothing.
    pub fn record_arrival(&mut self, workflow_id: &str, at: DateTime<Utc>) -> CheckInResult {
        let Some(participant) = self
            .pipeline
            .workflows
            .iter_mut()
            .find(|w| w.workflow_id == workflow_id)
        else {
            return CheckInResult::UnknownParticipant;
        };

        if participant.arrived_at.is_some() {
            return CheckInResult::Recorded {
                is_down: self.is_down(),
                changed: false,
            };
        }

        participant.arrived_at = Some(at);
        self.updated_at = at;
        if self.missing().next().is_none() {
            self.state = BarrierState::Down;
        }

        CheckInResult::Recorded {
            is_down: self.is_down(),
            changed: true,
        }
    }
}

/// Outcome of an atomic barrier check-in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInResult {
    /// No live barrier under that key
    Missing,

    /// The barrier does not list this participant
    UnknownParticipant,

    /// The arrival is recorded; `changed` is false for repeated check-ins
    Recorded { is_down: bool, changed: bool },
}

/// Idempotent record lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotentState {
    /// The guarded operation is in flight
    Tentative,

    /// The guarded operation finished and its result is cached
    Succeeded,
}

impl std::fmt::Display for IdempotentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tentative => write!(f, "tentative"),
            Self::Succeeded => write!(f, "succeeded"),
        }
    }
}

impl FromStr for IdempotentState {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tentative" => Ok(Self::Tentative),
            "succeeded" => Ok(Self::Succeeded),
            other => Err(StoreError::Database(format!(
                "unknown idempotent state: {}",
                other
            ))),
        }
    }
}

/// Dedup record keyed by a caller-computed fingerprint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotentRecord {
    pub fingerprint: String,
    pub state: IdempotentState,
    /// Token that created the tentative record
    pub owner: Uuid,
    pub result: Vec<serde_json::Value>,
    pub valid_until: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl IdempotentRecord {
    pub fn tentative(fingerprint: impl Into<String>, owner: Uuid, valid_until: DateTime<Utc>) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            state: IdempotentState::Tentative,
            owner,
            result: vec![],
            valid_until,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.valid_until <= now
    }
}

/// Outcome of inserting a tentative idempotent record
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotentInsert {
    /// The record was created (or replaced an expired one)
    Inserted(IdempotentRecord),

    /// A live record already holds the fingerprint
    Existing(IdempotentRecord),
}

/// Counts of records removed by one TTL sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    pub finished_instances: u64,
    pub expired_instances: u64,
    pub barriers: u64,
    pub idempotent_locks: u64,
}

impl ReapReport {
    pub fn total(&self) -> u64 {
        self.finished_instances + self.expired_instances + self.barriers + self.idempotent_locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn barrier(participants: &[&str]) -> BarrierInstance {
        let now = Utc::now();
        BarrierInstance {
            id: Uuid::now_v7(),
            app_id: "app".to_string(),
            name: "join".to_string(),
            state: BarrierState::Standing,
            pipeline: BarrierPipeline {
                execution_id: "exec-1".to_string(),
                workflows: participants.iter().map(|p| BarrierParticipant::new(*p)).collect(),
            },
            valid_until: now + chrono::Duration::days(30),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_arrivals_commute() {
        let mut forward = barrier(&["w1", "w2", "w3"]);
        let mut backward = forward.clone();
        let now = Utc::now();

        for w in ["w1", "w2", "w3"] {
            forward.record_arrival(w, now);
        }
        for w in ["w3", "w2", "w1"] {
            backward.record_arrival(w, now);
        }

        assert!(forward.is_down());
        assert!(backward.is_down());
    }

    #[test]
    fn test_repeated_arrival_is_noop() {
        let mut b = barrier(&["w1", "w2"]);
        let now = Utc::now();

        assert_eq!(
            b.record_arrival("w1", now),
            CheckInResult::Recorded {
                is_down: false,
                changed: true
            }
        );
        assert_eq!(
            b.record_arrival("w1", now),
            CheckInResult::Recorded {
                is_down: false,
                changed: false
            }
        );
        assert_eq!(b.missing().count(), 1);
    }

    #[test]
    fn test_unknown_participant() {
        let mut b = barrier(&["w1"]);
        assert_eq!(
            b.record_arrival("stranger", Utc::now()),
            CheckInResult::UnknownParticipant
        );
        assert!(!b.is_down());
    }

    #[test]
    fn test_enum_round_trip_through_text() {
        for state in [InstanceState::Blocked, InstanceState::Active, InstanceState::Finished] {
            assert_eq!(state.to_string().parse::<InstanceState>().unwrap(), state);
        }
        assert!("bogus".parse::<ConstraintStrategy>().is_err());
    }
}
