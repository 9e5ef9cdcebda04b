//! Failure strategy selection

use super::model::{ExecutionScope, FailureStrategy, FailureType, RepairActionCode};

/// Pick the strategy governing a failure of `state_name`
///
/// Filters by failure type and by specific steps, drops entries that only
/// handle timeouts (phase-level events are not timeouts), then prefers
/// rolling back the workflow, then rolling back the phase. Failing both, the
/// first entry scoped to phases applies when the event happened inside a
/// phase, else the first workflow-scoped entry.
pub fn select_failure_strategy<'a>(
    strategies: &'a [FailureStrategy],
    failure_types: &[FailureType],
    state_name: &str,
    in_phase: bool,
) -> Option<&'a FailureStrategy> {
    let candidates: Vec<&FailureStrategy> = strategies
        .iter()
        .filter(|s| {
            s.failure_types.is_empty()
                || failure_types.is_empty()
                || s.failure_types.iter().any(|t| failure_types.contains(t))
        })
        .filter(|s| s.specific_steps.is_empty() || s.specific_steps.iter().any(|n| n == state_name))
        .filter(|s| s.failure_types != [FailureType::Timeout])
        .collect();

    let first_with = |code: RepairActionCode| {
        candidates
            .iter()
            .find(|s| s.repair_action_code == code)
            .copied()
    };
    let first_scoped = |scope: ExecutionScope| {
        candidates
            .iter()
            .find(|s| s.execution_scope == scope)
            .copied()
    };

    first_with(RepairActionCode::RollbackWorkflow)
        .or_else(|| first_with(RepairActionCode::RollbackPhase))
        .or_else(|| {
            if in_phase {
                first_scoped(ExecutionScope::WorkflowPhase)
            } else {
                None
            }
        })
        .or_else(|| first_scoped(ExecutionScope::Workflow))
}
