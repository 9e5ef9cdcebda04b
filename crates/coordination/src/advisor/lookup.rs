//! Read access to workflow configuration

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use super::model::{Workflow, WorkflowExecution};

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("lookup backend error: {0}")]
    Backend(String),
}

/// Source of executions and workflow definitions for the advisor
#[async_trait]
pub trait WorkflowLookup: Send + Sync + 'static {
    async fn get_execution_details(
        &self,
        app_id: &str,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, LookupError>;

    async fn get_workflow(
        &self,
        app_id: &str,
        workflow_id: &str,
    ) -> Result<Option<Workflow>, LookupError>;
}

/// Map-backed lookup for tests and embedded use
#[derive(Default)]
pub struct InMemoryWorkflowLookup {
    executions: RwLock<HashMap<(String, String), WorkflowExecution>>,
    workflows: RwLock<HashMap<(String, String), Workflow>>,
}

impl InMemoryWorkflowLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_execution(&self, execution: WorkflowExecution) {
        self.executions
            .write()
            .insert((execution.app_id.clone(), execution.id.clone()), execution);
    }

    pub fn insert_workflow(&self, workflow: Workflow) {
        self.workflows
            .write()
            .insert((workflow.app_id.clone(), workflow.id.clone()), workflow);
    }
}

#[async_trait]
impl WorkflowLookup for InMemoryWorkflowLookup {
    async fn get_execution_details(
        &self,
        app_id: &str,
        execution_id: &str,
    ) -> Result<Option<WorkflowExecution>, LookupError> {
        Ok(self
            .executions
            .read()
            .get(&(app_id.to_string(), execution_id.to_string()))
            .cloned())
    }

    async fn get_workflow(
        &self,
        app_id: &str,
        workflow_id: &str,
    ) -> Result<Option<Workflow>, LookupError> {
        Ok(self
            .workflows
            .read()
            .get(&(app_id.to_string(), workflow_id.to_string()))
            .cloned())
    }
}
