//! Rollback advisor for phased deployments
//!
//! The execution engine reports every state completion. For phase states of a
//! canary-style workflow the advisor answers with the next transition: into
//! the failed phase's rollback phase, backwards through earlier rollback
//! phases, or to a terminal failure.
//!
//! ```text
//!   Phase 1 ──► Phase 2 ──► Phase 3 ✗
//!                               │ RollbackWorkflow
//!                               ▼
//!   MarkFailed ◄── Rollback 1 ◄── Rollback 2 ◄── Rollback 3
//! ```
//!
//! The advisor never fails the engine: configuration problems are logged and
//! answered with [`Decision::None`].

mod lookup;
mod model;
mod strategy;

pub use lookup::{InMemoryWorkflowLookup, LookupError, WorkflowLookup};
pub use model::{
    CanaryOrchestration, Decision, ExecutionContext, ExecutionEvent, ExecutionScope,
    ExecutionStatus, FailureStrategy, FailureType, OrchestrationWorkflow, PhaseNode,
    RepairActionCode, StateNode, Workflow, WorkflowExecution, WorkflowPhase, WorkflowType,
};
pub use strategy::select_failure_strategy;

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum AdvisorError {
    #[error("advisor configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Decides the next transition after a phase completes
#[derive(Clone)]
pub struct RollbackAdvisor {
    lookup: Arc<dyn WorkflowLookup>,
}

impl RollbackAdvisor {
    pub fn new(lookup: Arc<dyn WorkflowLookup>) -> Self {
        Self { lookup }
    }

    #[instrument(
        skip(self, event),
        fields(
            execution_id = %event.context.workflow_execution_id,
            state = %event.state.name(),
            status = ?event.status,
        )
    )]
    pub async fn advise(&self, event: &ExecutionEvent) -> Decision {
        let Some(phase) = event.state.as_phase() else {
            return Decision::None;
        };

        let canary = match self.orchestration(&event.context).await {
            Ok(canary) => canary,
            Err(e) => {
                warn!(error = %e, "No rollback advice for phase");
                return Decision::None;
            }
        };

        let decision = if phase.rollback {
            advise_rollback_phase(&canary, phase, event)
        } else {
            advise_forward_phase(&canary, phase, event)
        };
        debug!(?decision, "advised");
        decision
    }

    async fn orchestration(
        &self,
        context: &ExecutionContext,
    ) -> Result<CanaryOrchestration, AdvisorError> {
        let execution = self
            .lookup
            .get_execution_details(&context.app_id, &context.workflow_execution_id)
            .await?
            .ok_or_else(|| {
                AdvisorError::ConfigurationMissing(format!(
                    "execution {} not found",
                    context.workflow_execution_id
                ))
            })?;

        if execution.workflow_type != WorkflowType::Orchestration {
            return Err(AdvisorError::ConfigurationMissing(format!(
                "execution {} is not an orchestration",
                execution.id
            )));
        }

        let workflow = self
            .lookup
            .get_workflow(&context.app_id, &execution.workflow_id)
            .await?
            .ok_or_else(|| {
                AdvisorError::ConfigurationMissing(format!(
                    "workflow {} not found",
                    execution.workflow_id
                ))
            })?;

        match workflow.orchestration {
            Some(OrchestrationWorkflow::Canary(canary)) => Ok(canary),
            _ => Err(AdvisorError::ConfigurationMissing(format!(
                "workflow {} has no phased orchestration",
                workflow.id
            ))),
        }
    }
}

fn advise_forward_phase(
    canary: &CanaryOrchestration,
    phase: &PhaseNode,
    event: &ExecutionEvent,
) -> Decision {
    if !event.status.is_negative() {
        return Decision::None;
    }
    let Some(strategy) = select_failure_strategy(
        &canary.failure_strategies,
        &event.failure_types,
        &phase.name,
        true,
    ) else {
        return Decision::None;
    };

    let action = match strategy.repair_action_code {
        RepairActionCode::Retry if event.retry_count < strategy.retry_count => {
            return Decision::Retry {
                wait: strategy.retry_wait(event.retry_count),
            };
        }
        RepairActionCode::Retry => match strategy.repair_action_code_after_retry {
            Some(after) if after != RepairActionCode::Retry => after,
            _ => return Decision::None,
        },
        code => code,
    };

    match action {
        RepairActionCode::RollbackWorkflow | RepairActionCode::RollbackPhase => canary
            .rollback_phase_for(&phase.id)
            .map(|rollback| Decision::transition_to(rollback.name.clone()))
            .unwrap_or(Decision::None),
        RepairActionCode::Ignore => Decision::Ignore,
        RepairActionCode::EndExecution => Decision::EndExecution,
        RepairActionCode::Retry => Decision::None,
    }
}

fn advise_rollback_phase(
    canary: &CanaryOrchestration,
    phase: &PhaseNode,
    event: &ExecutionEvent,
) -> Decision {
    if !matches!(
        event.status,
        ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Error
    ) {
        return Decision::None;
    }

    let governing = select_failure_strategy(
        &canary.failure_strategies,
        &event.failure_types,
        &phase.name,
        true,
    )
    .map(|s| s.repair_action_code);
    if governing != Some(RepairActionCode::RollbackWorkflow) {
        return Decision::MarkFailed;
    }

    let Some(index) = phase
        .phase_name_for_rollback
        .as_deref()
        .and_then(|name| canary.phase_index(name))
    else {
        return Decision::None;
    };
    if index == 0 {
        return Decision::MarkFailed;
    }

    let previous = &canary.workflow_phases[index - 1];
    canary
        .rollback_phase_for(&previous.id)
        .map(|rollback| Decision::transition_to(rollback.name.clone()))
        .unwrap_or(Decision::MarkFailed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    const APP: &str = "app-1";
    const EXECUTION: &str = "exec-1";

    fn three_phase_canary(strategy: FailureStrategy) -> CanaryOrchestration {
        let mut canary = CanaryOrchestration::default().with_failure_strategy(strategy);
        for n in 1..=3 {
            let forward = WorkflowPhase::forward(format!("p{n}"), format!("Phase {n}"));
            let rollback = WorkflowPhase::rollback_of(
                format!("rb{n}"),
                format!("Rollback Phase {n}"),
                &forward,
            );
            canary = canary.with_phase(forward, Some(rollback));
        }
        canary
    }

    fn advisor_for(canary: CanaryOrchestration) -> RollbackAdvisor {
        let lookup = InMemoryWorkflowLookup::new();
        lookup.insert_execution(WorkflowExecution {
            id: EXECUTION.into(),
            app_id: APP.into(),
            workflow_id: "wf-1".into(),
            workflow_type: WorkflowType::Orchestration,
        });
        lookup.insert_workflow(Workflow {
            id: "wf-1".into(),
            app_id: APP.into(),
            name: "canary".into(),
            orchestration: Some(OrchestrationWorkflow::Canary(canary)),
        });
        RollbackAdvisor::new(Arc::new(lookup))
    }

    fn event(state: StateNode, status: ExecutionStatus) -> ExecutionEvent {
        ExecutionEvent {
            context: ExecutionContext {
                app_id: APP.into(),
                workflow_execution_id: EXECUTION.into(),
            },
            state,
            status,
            failure_types: vec![],
            retry_count: 0,
        }
    }

    fn forward(n: u32) -> StateNode {
        StateNode::Phase(PhaseNode {
            id: format!("p{n}"),
            name: format!("Phase {n}"),
            rollback: false,
            phase_name_for_rollback: None,
        })
    }

    fn rollback(n: u32) -> StateNode {
        StateNode::Phase(PhaseNode {
            id: format!("rb{n}"),
            name: format!("Rollback Phase {n}"),
            rollback: true,
            phase_name_for_rollback: Some(format!("Phase {n}")),
        })
    }

    #[tokio::test]
    async fn test_rollback_workflow_walks_back_three_phases() {
        let advisor = advisor_for(three_phase_canary(FailureStrategy::new(
            RepairActionCode::RollbackWorkflow,
        )));

        assert_eq!(
            advisor.advise(&event(forward(3), ExecutionStatus::Failed)).await,
            Decision::transition_to("Rollback Phase 3")
        );
        assert_eq!(
            advisor.advise(&event(rollback(3), ExecutionStatus::Success)).await,
            Decision::transition_to("Rollback Phase 2")
        );
        assert_eq!(
            advisor.advise(&event(rollback(2), ExecutionStatus::Success)).await,
            Decision::transition_to("Rollback Phase 1")
        );
        assert_eq!(
            advisor.advise(&event(rollback(1), ExecutionStatus::Success)).await,
            Decision::MarkFailed
        );
    }

    #[tokio::test]
    async fn test_failed_rollback_phase_keeps_walking_back() {
        let advisor = advisor_for(three_phase_canary(FailureStrategy::new(
            RepairActionCode::RollbackWorkflow,
        )));
        assert_eq!(
            advisor.advise(&event(rollback(2), ExecutionStatus::Failed)).await,
            Decision::transition_to("Rollback Phase 1")
        );
    }

    #[tokio::test]
    async fn test_rollback_phase_stops_after_one_phase() {
        let advisor = advisor_for(three_phase_canary(FailureStrategy::new(
            RepairActionCode::RollbackPhase,
        )));

        assert_eq!(
            advisor.advise(&event(forward(2), ExecutionStatus::Error)).await,
            Decision::transition_to("Rollback Phase 2")
        );
        assert_eq!(
            advisor.advise(&event(rollback(2), ExecutionStatus::Success)).await,
            Decision::MarkFailed
        );
    }

    #[tokio::test]
    async fn test_successful_forward_phase_gets_no_advice() {
        let advisor = advisor_for(three_phase_canary(FailureStrategy::new(
            RepairActionCode::RollbackWorkflow,
        )));
        assert_eq!(
            advisor.advise(&event(forward(1), ExecutionStatus::Success)).await,
            Decision::None
        );
    }

    #[tokio::test]
    async fn test_running_rollback_phase_gets_no_advice() {
        let advisor = advisor_for(three_phase_canary(FailureStrategy::new(
            RepairActionCode::RollbackWorkflow,
        )));
        assert_eq!(
            advisor.advise(&event(rollback(2), ExecutionStatus::Running)).await,
            Decision::None
        );
    }

    #[tokio::test]
    async fn test_non_phase_states_ignored() {
        let advisor = advisor_for(three_phase_canary(FailureStrategy::new(
            RepairActionCode::RollbackWorkflow,
        )));
        let step = StateNode::Step {
            name: "Deploy service".into(),
        };
        assert_eq!(
            advisor.advise(&event(step, ExecutionStatus::Failed)).await,
            Decision::None
        );
    }

    #[tokio::test]
    async fn test_unmapped_phase_gets_no_advice() {
        let canary = CanaryOrchestration::default()
            .with_phase(WorkflowPhase::forward("p1", "Phase 1"), None)
            .with_failure_strategy(FailureStrategy::new(RepairActionCode::RollbackWorkflow));
        let advisor = advisor_for(canary);
        assert_eq!(
            advisor.advise(&event(forward(1), ExecutionStatus::Failed)).await,
            Decision::None
        );
    }

    #[tokio::test]
    async fn test_ignore_and_end_execution() {
        let advisor = advisor_for(three_phase_canary(FailureStrategy::new(
            RepairActionCode::Ignore,
        )));
        assert_eq!(
            advisor.advise(&event(forward(1), ExecutionStatus::Failed)).await,
            Decision::Ignore
        );

        let advisor = advisor_for(three_phase_canary(FailureStrategy::new(
            RepairActionCode::EndExecution,
        )));
        assert_eq!(
            advisor.advise(&event(forward(1), ExecutionStatus::Failed)).await,
            Decision::EndExecution
        );
    }

    #[tokio::test]
    async fn test_retry_then_fallback_action() {
        let advisor = advisor_for(three_phase_canary(
            FailureStrategy::new(RepairActionCode::Retry).with_retry(
                2,
                vec![Duration::from_secs(10), Duration::from_secs(20)],
                RepairActionCode::RollbackPhase,
            ),
        ));

        let mut failed = event(forward(2), ExecutionStatus::Failed);
        assert_eq!(
            advisor.advise(&failed).await,
            Decision::Retry {
                wait: Duration::from_secs(10)
            }
        );

        failed.retry_count = 1;
        assert_eq!(
            advisor.advise(&failed).await,
            Decision::Retry {
                wait: Duration::from_secs(20)
            }
        );

        failed.retry_count = 2;
        assert_eq!(
            advisor.advise(&failed).await,
            Decision::transition_to("Rollback Phase 2")
        );
    }

    #[tokio::test]
    async fn test_missing_configuration_gets_no_advice() {
        let advisor = RollbackAdvisor::new(Arc::new(InMemoryWorkflowLookup::new()));
        assert_eq!(
            advisor.advise(&event(forward(1), ExecutionStatus::Failed)).await,
            Decision::None
        );
    }

    #[tokio::test]
    async fn test_pipeline_execution_gets_no_advice() {
        let lookup = InMemoryWorkflowLookup::new();
        lookup.insert_execution(WorkflowExecution {
            id: EXECUTION.into(),
            app_id: APP.into(),
            workflow_id: "wf-1".into(),
            workflow_type: WorkflowType::Pipeline,
        });
        let advisor = RollbackAdvisor::new(Arc::new(lookup));
        assert_eq!(
            advisor.advise(&event(forward(1), ExecutionStatus::Failed)).await,
            Decision::None
        );
    }

    struct FailingLookup;

    #[async_trait]
    impl WorkflowLookup for FailingLookup {
        async fn get_execution_details(
            &self,
            _app_id: &str,
            _execution_id: &str,
        ) -> Result<Option<WorkflowExecution>, LookupError> {
            Err(LookupError::Backend("connection refused".into()))
        }

        async fn get_workflow(
            &self,
            _app_id: &str,
            _workflow_id: &str,
        ) -> Result<Option<Workflow>, LookupError> {
            Err(LookupError::Backend("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_lookup_error_gets_no_advice() {
        let advisor = RollbackAdvisor::new(Arc::new(FailingLookup));
        assert_eq!(
            advisor.advise(&event(forward(1), ExecutionStatus::Failed)).await,
            Decision::None
        );
    }
}
