//! Node-level error type.

use thiserror::Error;

/// Errors returned by a node's `execute` method.
///
/// The engine uses the variant to decide retry behaviour:
/// - `Retryable`    : the node is re-invoked with exponential back-off.
/// - `Fatal`        : the node is immediately marked as failed.
/// - `InvalidConfig`: the resolved configuration cannot be executed; never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Transient failure; the engine should re-try the node.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),

    /// The configuration handed to the node is malformed.
    #[error("invalid node configuration: {0}")]
    InvalidConfig(String),
}

impl NodeError {
    /// Whether the engine may re-invoke the node after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
