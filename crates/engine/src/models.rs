//! Core domain models for the workflow engine.
//!
//! These types are the source of truth for what a workflow and an execution
//! look like in memory. All of them serialise to/from JSON, which is the
//! format workflow definition files and store backends exchange.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Trigger / Event
// ---------------------------------------------------------------------------

/// Starts a workflow when an inbound event carries exactly this source and
/// status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    pub source: String,
    pub status: String,
}

/// An inbound event offered to every workflow's triggers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub source: String,
    pub status: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(source: impl Into<String>, status: impl Into<String>, payload: Value) -> Self {
        Self {
            source: source.into(),
            status: status.into(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeDefinition
// ---------------------------------------------------------------------------

/// A single step in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique identifier within this workflow (referenced by `depends_on`).
    pub id: String,
    /// Maps to a registered `ExecutableNode` implementation.
    pub node_type: String,
    /// Configuration passed to the node after template resolution.
    #[serde(default)]
    pub config: Value,
    /// Nodes that must succeed before this one runs.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Overrides the engine-wide per-node timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, node_type: impl Into<String>, config: Value) -> Self {
        Self {
            id: id.into(),
            node_type: node_type.into(),
            config,
            depends_on: Vec::new(),
            timeout_ms: None,
        }
    }

    /// Builder-style helper to declare dependencies.
    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A complete workflow definition. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    pub name: String,
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub triggers: Vec<Trigger>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, nodes: Vec<NodeDefinition>, triggers: Vec<Trigger>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            nodes,
            triggers,
            created_at: Utc::now(),
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Forward-only: Pending → Running → terminal, Pending → terminal.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown execution status: {other}")),
        }
    }
}

/// Lifecycle of one node within one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }

    /// Forward-only: Pending → Running → {Succeeded | Failed | Skipped}.
    /// A node that never started may go straight to a terminal status.
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Pending => next != Self::Pending,
            Self::Running => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

// ---------------------------------------------------------------------------
// NodeResult
// ---------------------------------------------------------------------------

/// Recorded outcome of one node within one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResult {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NodeResult {
    pub fn pending() -> Self {
        Self {
            status: NodeStatus::Pending,
            output: None,
            error: None,
            attempts: 0,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn running() -> Self {
        Self {
            status: NodeStatus::Running,
            started_at: Some(Utc::now()),
            ..Self::pending()
        }
    }

    pub fn succeeded(self, output: Value, attempts: u32) -> Self {
        Self {
            status: NodeStatus::Succeeded,
            output: Some(output),
            attempts,
            completed_at: Some(Utc::now()),
            ..self
        }
    }

    pub fn failed(self, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            status: NodeStatus::Failed,
            error: Some(error.into()),
            attempts,
            completed_at: Some(Utc::now()),
            ..self
        }
    }

    pub fn skipped(self, reason: impl Into<String>) -> Self {
        Self {
            status: NodeStatus::Skipped,
            error: Some(reason.into()),
            completed_at: Some(Utc::now()),
            ..self
        }
    }
}

// ---------------------------------------------------------------------------
// Webhook subscriptions
// ---------------------------------------------------------------------------

/// Lifecycle events a webhook subscription can ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WebhookEventKind {
    #[serde(rename = "node.succeeded")]
    NodeSucceeded,
    #[serde(rename = "node.failed")]
    NodeFailed,
    #[serde(rename = "node.skipped")]
    NodeSkipped,
    #[serde(rename = "execution.completed")]
    ExecutionCompleted,
    #[serde(rename = "execution.failed")]
    ExecutionFailed,
    #[serde(rename = "execution.cancelled")]
    ExecutionCancelled,
}

impl WebhookEventKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::NodeSucceeded => "node.succeeded",
            Self::NodeFailed => "node.failed",
            Self::NodeSkipped => "node.skipped",
            Self::ExecutionCompleted => "execution.completed",
            Self::ExecutionFailed => "execution.failed",
            Self::ExecutionCancelled => "execution.cancelled",
        }
    }

    pub fn is_node_event(self) -> bool {
        matches!(self, Self::NodeSucceeded | Self::NodeFailed | Self::NodeSkipped)
    }

    /// Event emitted for a node reaching `status`, if terminal.
    pub fn for_node(status: NodeStatus) -> Option<Self> {
        match status {
            NodeStatus::Succeeded => Some(Self::NodeSucceeded),
            NodeStatus::Failed => Some(Self::NodeFailed),
            NodeStatus::Skipped => Some(Self::NodeSkipped),
            NodeStatus::Pending | NodeStatus::Running => None,
        }
    }

    /// Event emitted for an execution reaching `status`, if terminal.
    pub fn for_execution(status: ExecutionStatus) -> Option<Self> {
        match status {
            ExecutionStatus::Completed => Some(Self::ExecutionCompleted),
            ExecutionStatus::Failed => Some(Self::ExecutionFailed),
            ExecutionStatus::Cancelled => Some(Self::ExecutionCancelled),
            ExecutionStatus::Pending | ExecutionStatus::Running => None,
        }
    }
}

impl fmt::Display for WebhookEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// An external subscriber supplied when an execution is started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub url: String,
    pub events: Vec<WebhookEventKind>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Restricts node events to these node IDs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ids: Option<Vec<String>>,
}

impl WebhookSubscription {
    pub fn new(url: impl Into<String>, events: Vec<WebhookEventKind>) -> Self {
        Self {
            url: url.into(),
            events,
            headers: HashMap::new(),
            node_ids: None,
        }
    }

    pub fn for_nodes<I, S>(mut self, node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.node_ids = Some(node_ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// One run of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub status: ExecutionStatus,
    /// Initial variable scope.
    pub input: Value,
    pub node_results: BTreeMap<String, NodeResult>,
    #[serde(default)]
    pub webhooks: Vec<WebhookSubscription>,
    /// Execution-level failure detail (e.g. an invalid graph).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of times this execution has been retried.
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// A fresh `Pending` execution with a `Pending` result for every node.
    pub fn new(workflow: &Workflow, input: Value, webhooks: Vec<WebhookSubscription>) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_id: workflow.id,
            status: ExecutionStatus::Pending,
            input,
            node_results: workflow
                .nodes
                .iter()
                .map(|n| (n.id.clone(), NodeResult::pending()))
                .collect(),
            webhooks,
            error: None,
            retry_count: 0,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn node_status(&self, node_id: &str) -> Option<NodeStatus> {
        self.node_results.get(node_id).map(|r| r.status)
    }

    /// IDs of the nodes currently in `status`.
    pub fn nodes_with_status(&self, status: NodeStatus) -> Vec<&str> {
        self.node_results
            .iter()
            .filter(|(_, r)| r.status == status)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_status_only_moves_forward() {
        use NodeStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Skipped));
        assert!(Running.can_transition_to(Succeeded));
        assert!(Running.can_transition_to(Skipped));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Succeeded.can_transition_to(Failed));
        assert!(!Skipped.can_transition_to(Running));
    }

    #[test]
    fn execution_status_round_trips_through_strings() {
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(status.to_string().parse::<ExecutionStatus>(), Ok(status));
        }
        assert!("exploded".parse::<ExecutionStatus>().is_err());
    }

    #[test]
    fn workflow_definition_parses_with_defaults() {
        let wf: Workflow = serde_json::from_value(json!({
            "name": "onboard",
            "triggers": [{ "source": "api", "status": "active" }],
            "nodes": [
                { "id": "fetch", "node_type": "http", "config": { "url": "https://x/{{.user_id}}" } },
                { "id": "notify", "node_type": "http", "depends_on": ["fetch"], "timeout_ms": 500 }
            ]
        }))
        .expect("valid definition");

        assert_eq!(wf.nodes.len(), 2);
        assert!(wf.nodes[0].depends_on.is_empty());
        assert_eq!(wf.node("notify").unwrap().timeout(), Some(Duration::from_millis(500)));
        assert_eq!(wf.triggers[0], Trigger { source: "api".into(), status: "active".into() });
    }

    #[test]
    fn webhook_events_use_dotted_names() {
        let sub: WebhookSubscription = serde_json::from_value(json!({
            "url": "https://hooks.example.com",
            "events": ["node.failed", "execution.completed"]
        }))
        .unwrap();
        assert_eq!(sub.events, vec![WebhookEventKind::NodeFailed, WebhookEventKind::ExecutionCompleted]);
        assert!(serde_json::from_value::<WebhookEventKind>(json!("node.exploded")).is_err());
    }

    #[test]
    fn new_execution_has_pending_result_per_node() {
        let wf = Workflow::new(
            "wf",
            vec![
                NodeDefinition::new("a", "mock", Value::Null),
                NodeDefinition::new("b", "mock", Value::Null).depends_on(["a"]),
            ],
            vec![],
        );
        let exec = Execution::new(&wf, json!({}), vec![]);
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.nodes_with_status(NodeStatus::Pending), vec!["a", "b"]);
    }
}
