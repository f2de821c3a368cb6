//! Engine-level error types.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Coarse classification of an [`EngineError`], for callers that translate
/// engine errors into protocol status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidId,
    Unauthorized,
    Forbidden,
    Conflict,
    Validation,
    Internal,
}

/// Errors produced by the workflow engine (validation + execution).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Lookup errors ------
    #[error("workflow '{0}' not found")]
    WorkflowNotFound(Uuid),

    #[error("execution '{0}' not found")]
    ExecutionNotFound(Uuid),

    #[error("trigger '{0}' not found")]
    TriggerNotFound(String),

    #[error("resource '{0}' not found")]
    ResourceNotFound(String),

    /// An identifier could not be parsed.
    #[error("invalid id: '{0}'")]
    InvalidId(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    /// A workflow with the same ID is already stored.
    #[error("workflow '{0}' already exists")]
    WorkflowExists(Uuid),

    #[error("validation failed: {0}")]
    ValidationFailed(String),

    // ------ Graph validation errors ------
    /// Two or more nodes share the same ID.
    #[error("duplicate node ID: '{0}'")]
    DuplicateNodeId(String),

    /// A node depends on a node ID that doesn't exist in the workflow.
    #[error("node '{node_id}' depends on unknown node '{dependency}'")]
    UnknownDependency { node_id: String, dependency: String },

    /// Wave scheduling could not place these nodes.
    #[error("workflow graph contains a cycle through {remaining:?}")]
    GraphCycle { remaining: Vec<String> },

    // ------ Node errors ------
    /// Unresolvable template or unknown node type.
    #[error("node '{node_id}' is misconfigured: {message}")]
    NodeConfiguration { node_id: String, message: String },

    /// The executor reported a failure.
    #[error("node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    /// A node's retryable error was exhausted.
    #[error("node '{node_id}' exceeded retry limit: {message}")]
    NodeRetryExhausted { node_id: String, message: String },

    #[error("node '{node_id}' timed out after {timeout:?}")]
    NodeTimeout { node_id: String, timeout: Duration },

    // ------ Collaborator errors ------
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WorkflowNotFound(_)
            | Self::ExecutionNotFound(_)
            | Self::TriggerNotFound(_)
            | Self::ResourceNotFound(_) => ErrorKind::NotFound,
            Self::InvalidId(_) => ErrorKind::InvalidId,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::WorkflowExists(_) | Self::Store(StoreError::Conflict(_)) => ErrorKind::Conflict,
            Self::ValidationFailed(_)
            | Self::DuplicateNodeId(_)
            | Self::UnknownDependency { .. }
            | Self::GraphCycle { .. } => ErrorKind::Validation,
            Self::NodeConfiguration { .. }
            | Self::NodeExecution { .. }
            | Self::NodeRetryExhausted { .. }
            | Self::NodeTimeout { .. }
            | Self::Store(_)
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}
