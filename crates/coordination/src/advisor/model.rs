//! Workflow configuration and execution events read by the advisor

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Status carried by a state-completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    New,
    Starting,
    Running,
    Waiting,
    Paused,
    Success,
    Failed,
    Error,
    Expired,
    Aborted,
    Skipped,
    Rejected,
}

impl ExecutionStatus {
    /// Statuses that count as a failure of the state
    pub fn is_negative(self) -> bool {
        matches!(self, Self::Failed | Self::Error | Self::Expired)
    }
}

/// Classification of a failure reported with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureType {
    Connectivity,
    Authentication,
    VerificationFailure,
    ApplicationError,
    DelegateProvisioning,
    Timeout,
}

/// Configured response to a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairActionCode {
    RollbackPhase,
    RollbackWorkflow,
    Ignore,
    EndExecution,
    Retry,
}

/// Where a failure strategy applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionScope {
    Workflow,
    WorkflowPhase,
}

/// One entry of a workflow's failure-repair policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureStrategy {
    pub repair_action_code: RepairActionCode,
    /// Failure types this entry handles; empty handles any
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
    /// State names this entry is limited to; empty applies everywhere
    #[serde(default)]
    pub specific_steps: Vec<String>,
    pub execution_scope: ExecutionScope,
    #[serde(default)]
    pub retry_count: u32,
    /// Wait before each retry; the last value repeats
    #[serde(default, with = "secs_list")]
    pub retry_intervals: Vec<Duration>,
    #[serde(default)]
    pub repair_action_code_after_retry: Option<RepairActionCode>,
}

impl FailureStrategy {
    pub fn new(repair_action_code: RepairActionCode) -> Self {
        Self {
            repair_action_code,
            failure_types: vec![],
            specific_steps: vec![],
            execution_scope: ExecutionScope::Workflow,
            retry_count: 0,
            retry_intervals: vec![],
            repair_action_code_after_retry: None,
        }
    }

    pub fn with_failure_types(mut self, failure_types: Vec<FailureType>) -> Self {
        self.failure_types = failure_types;
        self
    }

    pub fn with_specific_steps(mut self, steps: Vec<String>) -> Self {
        self.specific_steps = steps;
        self
    }

    pub fn with_scope(mut self, scope: ExecutionScope) -> Self {
        self.execution_scope = scope;
        self
    }

    /// Configure retries and the action taken once they run out
    pub fn with_retry(
        mut self,
        retry_count: u32,
        retry_intervals: Vec<Duration>,
        after_retry: RepairActionCode,
    ) -> Self {
        self.retry_count = retry_count;
        self.retry_intervals = retry_intervals;
        self.repair_action_code_after_retry = Some(after_retry);
        self
    }

    /// Wait before the retry following `retries_done` earlier retries
    pub fn retry_wait(&self, retries_done: u32) -> Duration {
        self.retry_intervals
            .get(retries_done as usize)
            .or(self.retry_intervals.last())
            .copied()
            .unwrap_or(Duration::ZERO)
    }
}

/// A forward or rollback phase of a canary orchestration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowPhase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub rollback: bool,
    /// For rollback phases: the name of the forward phase being undone
    #[serde(default)]
    pub phase_name_for_rollback: Option<String>,
}

impl WorkflowPhase {
    pub fn forward(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rollback: false,
            phase_name_for_rollback: None,
        }
    }

    /// The rollback phase undoing `forward`
    pub fn rollback_of(id: impl Into<String>, name: impl Into<String>, forward: &WorkflowPhase) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            rollback: true,
            phase_name_for_rollback: Some(forward.name.clone()),
        }
    }
}

/// Phased orchestration with per-phase rollback
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanaryOrchestration {
    /// Forward phases in execution order
    pub workflow_phases: Vec<WorkflowPhase>,
    /// Forward phase id to its rollback phase
    pub rollback_workflow_phase_id_map: HashMap<String, WorkflowPhase>,
    pub failure_strategies: Vec<FailureStrategy>,
}

impl CanaryOrchestration {
    /// Append a forward phase with its rollback phase
    pub fn with_phase(mut self, phase: WorkflowPhase, rollback: Option<WorkflowPhase>) -> Self {
        if let Some(rollback) = rollback {
            self.rollback_workflow_phase_id_map
                .insert(phase.id.clone(), rollback);
        }
        self.workflow_phases.push(phase);
        self
    }

    pub fn with_failure_strategy(mut self, strategy: FailureStrategy) -> Self {
        self.failure_strategies.push(strategy);
        self
    }

    /// Rollback phase mapped from a forward phase id
    pub fn rollback_phase_for(&self, phase_id: &str) -> Option<&WorkflowPhase> {
        self.rollback_workflow_phase_id_map.get(phase_id)
    }

    /// Position of a forward phase by name
    pub fn phase_index(&self, name: &str) -> Option<usize> {
        self.workflow_phases.iter().position(|p| p.name == name)
    }
}

/// Orchestration attached to a workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestrationWorkflow {
    /// Canary and the other phased orchestrations (basic, rolling, blue/green)
    Canary(CanaryOrchestration),
    /// Custom graphs without a phase/rollback structure
    Custom,
}

impl OrchestrationWorkflow {
    pub fn as_canary(&self) -> Option<&CanaryOrchestration> {
        match self {
            Self::Canary(canary) => Some(canary),
            Self::Custom => None,
        }
    }
}

/// Workflow definition as stored by the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub app_id: String,
    pub name: String,
    pub orchestration: Option<OrchestrationWorkflow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Orchestration,
    Pipeline,
}

/// One execution of a workflow or pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub app_id: String,
    pub workflow_id: String,
    pub workflow_type: WorkflowType,
}

/// Where an event comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    pub app_id: String,
    pub workflow_execution_id: String,
}

/// A phase state of the running state machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseNode {
    /// Id of the forward phase, or of the rollback phase for rollback nodes
    pub id: String,
    pub name: String,
    pub rollback: bool,
    /// For rollback nodes: the forward phase being undone
    pub phase_name_for_rollback: Option<String>,
}

/// State that produced an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateNode {
    Phase(PhaseNode),
    Step { name: String },
    Other { name: String },
}

impl StateNode {
    pub fn as_phase(&self) -> Option<&PhaseNode> {
        match self {
            Self::Phase(phase) => Some(phase),
            _ => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Phase(phase) => &phase.name,
            Self::Step { name } | Self::Other { name } => name,
        }
    }
}

/// State-completion event sent by the execution engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub context: ExecutionContext,
    pub state: StateNode,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub failure_types: Vec<FailureType>,
    /// Retries already performed for this state
    #[serde(default)]
    pub retry_count: u32,
}

/// Next transition advised to the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    /// No advice; the engine's default handling applies
    None,
    MarkFailed,
    TransitionTo { state_name: String },
    Ignore,
    EndExecution,
    Retry {
        #[serde(with = "crate::reliability::duration_millis")]
        wait: Duration,
    },
}

impl Decision {
    pub fn transition_to(state_name: impl Into<String>) -> Self {
        Self::TransitionTo {
            state_name: state_name.into(),
        }
    }
}

/// Serde support for a list of durations as whole seconds
mod secs_list {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(durations: &[Duration], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        durations
            .iter()
            .map(Duration::as_secs)
            .collect::<Vec<_>>()
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Vec::<u64>::deserialize(deserializer)?;
        Ok(secs.into_iter().map(Duration::from_secs).collect())
    }
}
