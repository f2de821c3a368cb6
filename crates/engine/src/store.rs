//! Storage collaborator.
//!
//! The engine persists workflows and executions through the
//! [`ExecutionStore`] trait. Incremental changes go through
//! [`ExecutionStore::record`], which applies one status or node-result
//! transition atomically and refuses backwards moves. [`MemoryStore`] is the
//! in-process implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::models::{Execution, ExecutionStatus, NodeResult, Workflow};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid transition for {subject}: {from} -> {to}")]
    InvalidTransition {
        subject: String,
        from: String,
        to: String,
    },

    #[error("store backend error: {0}")]
    Backend(String),
}

/// A single atomic change to a stored execution.
#[derive(Debug, Clone)]
pub enum ExecutionUpdate {
    Status {
        execution_id: Uuid,
        status: ExecutionStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    },
    Node {
        execution_id: Uuid,
        node_id: String,
        result: NodeResult,
    },
}

/// Filter and page window for listing executions.
#[derive(Debug, Clone)]
pub struct ExecutionFilter {
    pub workflow_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
    pub limit: usize,
    pub offset: usize,
}

/// One page of executions, newest first, plus the filtered total.
#[derive(Debug, Clone)]
pub struct ExecutionPage {
    pub executions: Vec<Execution>,
    pub total: usize,
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] if the ID is taken.
    async fn insert_workflow(&self, workflow: Workflow) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    /// Fails with [`StoreError::Conflict`] if the ID is taken.
    async fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    /// Replace a stored execution wholesale (used by retry).
    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<ExecutionPage, StoreError>;

    /// Apply one transition and return the updated execution.
    async fn record(&self, update: ExecutionUpdate) -> Result<Execution, StoreError>;
}

/// In-memory [`ExecutionStore`].
#[derive(Debug, Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    executions: RwLock<HashMap<Uuid, Execution>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn insert_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&workflow.id) {
            return Err(StoreError::Conflict(format!("workflow '{}' already exists", workflow.id)));
        }
        workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.read().await.get(&id).cloned())
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let mut workflows: Vec<Workflow> = self.workflows.read().await.values().cloned().collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(workflows)
    }

    async fn insert_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        if executions.contains_key(&execution.id) {
            return Err(StoreError::Conflict(format!("execution '{}' already exists", execution.id)));
        }
        executions.insert(execution.id, execution.clone());
        Ok(())
    }

    async fn save_execution(&self, execution: &Execution) -> Result<(), StoreError> {
        let mut executions = self.executions.write().await;
        let slot = executions.get_mut(&execution.id).ok_or_else(|| StoreError::NotFound {
            entity: "execution",
            id: execution.id.to_string(),
        })?;
        *slot = execution.clone();
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError> {
        Ok(self.executions.read().await.get(&id).cloned())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<ExecutionPage, StoreError> {
        let executions = self.executions.read().await;

        let mut matching: Vec<&Execution> = executions
            .values()
            .filter(|e| filter.workflow_id.map_or(true, |id| e.workflow_id == id))
            .filter(|e| filter.status.map_or(true, |s| e.status == s))
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        Ok(ExecutionPage {
            total: matching.len(),
            executions: matching
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit)
                .cloned()
                .collect(),
        })
    }

    async fn record(&self, update: ExecutionUpdate) -> Result<Execution, StoreError> {
        let mut executions = self.executions.write().await;

        match update {
            ExecutionUpdate::Status { execution_id, status, error, at } => {
                let execution = executions.get_mut(&execution_id).ok_or_else(|| StoreError::NotFound {
                    entity: "execution",
                    id: execution_id.to_string(),
                })?;

                if execution.status == status && status.is_terminal() {
                    // Settling an already-terminal execution to the same status is a no-op.
                    return Ok(execution.clone());
                }
                if !execution.status.can_transition_to(status) {
                    return Err(StoreError::InvalidTransition {
                        subject: format!("execution {execution_id}"),
                        from: execution.status.to_string(),
                        to: status.to_string(),
                    });
                }

                execution.status = status;
                if status == ExecutionStatus::Running && execution.started_at.is_none() {
                    execution.started_at = Some(at);
                }
                if status.is_terminal() {
                    execution.completed_at = Some(at);
                }
                if error.is_some() {
                    execution.error = error;
                }
                Ok(execution.clone())
            }

            ExecutionUpdate::Node { execution_id, node_id, result } => {
                let execution = executions.get_mut(&execution_id).ok_or_else(|| StoreError::NotFound {
                    entity: "execution",
                    id: execution_id.to_string(),
                })?;
                let current = execution.node_results.get_mut(&node_id).ok_or_else(|| StoreError::NotFound {
                    entity: "node result",
                    id: format!("{execution_id}/{node_id}"),
                })?;

                if !current.status.can_transition_to(result.status) {
                    return Err(StoreError::InvalidTransition {
                        subject: format!("node {node_id} of execution {execution_id}"),
                        from: current.status.to_string(),
                        to: result.status.to_string(),
                    });
                }
                *current = result;
                Ok(execution.clone())
            }
        }
    }
}
