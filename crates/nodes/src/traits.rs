//! The `ExecutableNode` trait: the contract every node type must fulfil.

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::NodeError;

/// Context passed to every node invocation.
///
/// Defined here (in the nodes crate) so both the engine and individual node
/// implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the parent workflow.
    pub workflow_id: Uuid,
    /// ID of the current execution run.
    pub execution_id: Uuid,
    /// ID of the node being executed.
    pub node_id: String,
    /// 1-based attempt number for this invocation.
    pub attempt: u32,
    /// Cancelled when the owning execution is cancelled.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(workflow_id: Uuid, execution_id: Uuid, node_id: impl Into<String>) -> Self {
        Self {
            workflow_id,
            execution_id,
            node_id: node_id.into(),
            attempt: 1,
            cancel: CancellationToken::new(),
        }
    }
}

/// The core node trait.
///
/// One implementation per node type; adding a node type means adding an
/// implementation and a registry entry.
#[async_trait]
pub trait ExecutableNode: Send + Sync {
    /// Execute the node with its fully resolved configuration and return
    /// the node's JSON output, which becomes visible to dependent nodes.
    async fn execute(
        &self,
        config: Value,
        ctx: &ExecutionContext,
    ) -> Result<Value, NodeError>;
}
