//! Workflow execution engine.
//!
//! `WorkflowExecutor` drives a single execution to a terminal status:
//! 1. Validates the DAG and compiles it into waves.
//! 2. Runs the waves in order. Every node of a wave is resolved against the
//!    outputs of its ancestors and dispatched concurrently; the wave ends
//!    when every task has been joined.
//! 3. Marks dependents of failed nodes as skipped while independent branches
//!    keep running.
//! 4. Handles `NodeError::Retryable` (up to `max_retries`), per-node
//!    timeouts and cooperative cancellation.
//! 5. Records every transition through the store and notifies webhook
//!    subscribers of terminal ones.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use nodes::{ExecutableNode, ExecutionContext, NodeError, NodeRegistry};

use crate::config::{backoff, EngineConfig};
use crate::dag::DependencyGraph;
use crate::models::{Execution, ExecutionStatus, NodeDefinition, NodeResult, NodeStatus, Workflow};
use crate::store::{ExecutionStore, ExecutionUpdate};
use crate::template;
use crate::webhook::{WebhookDispatcher, WebhookPayload};
use crate::EngineError;

const CANCELLED: &str = "execution cancelled";

/// Orchestrator that runs executions. Cheap to share behind an `Arc`; holds
/// no per-execution state.
pub struct WorkflowExecutor {
    store: Arc<dyn ExecutionStore>,
    registry: Arc<NodeRegistry>,
    webhooks: WebhookDispatcher,
    config: EngineConfig,
}

/// How a node task ended.
enum NodeOutcome {
    Succeeded { output: Value, attempts: u32 },
    Failed { error: EngineError, attempts: u32 },
    Cancelled,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: Arc<NodeRegistry>,
        webhooks: WebhookDispatcher,
        config: EngineConfig,
    ) -> Self {
        Self { store, registry, webhooks, config }
    }

    /// Run `execution` to a terminal status and return its final state.
    ///
    /// Nodes that already `Succeeded` (a retried execution) are not run
    /// again; their outputs feed dependents as recorded.
    #[instrument(
        name = "workflow_execute",
        skip_all,
        fields(workflow_id = %workflow.id, execution_id = %execution.id)
    )]
    pub async fn run(
        &self,
        workflow: Arc<Workflow>,
        mut execution: Execution,
        cancel: CancellationToken,
    ) -> Execution {
        // ------------------------------------------------------------------
        // Validate and compile the DAG into waves.
        // ------------------------------------------------------------------
        let (graph, waves) = match DependencyGraph::build(&workflow)
            .and_then(|graph| graph.waves().map(|waves| (graph, waves)))
        {
            Ok(plan) => plan,
            Err(e) => {
                error!(error = %e, "workflow graph is invalid, failing execution");
                return self.abort_invalid(execution, e).await;
            }
        };

        if cancel.is_cancelled() {
            return self.finish(execution, &cancel).await;
        }

        info!(waves = waves.len(), nodes = graph.node_ids().len(), "workflow_started");
        self.set_status(&mut execution, ExecutionStatus::Running, None).await;

        // A cancel that landed before the token was observed shows up as an
        // adopted terminal status.
        if cancel.is_cancelled() || execution.status.is_terminal() {
            warn!(status = %execution.status, "execution settled before its first wave");
            return self.finish(execution, &cancel).await;
        }

        // ------------------------------------------------------------------
        // Execute wave by wave.
        // ------------------------------------------------------------------
        for (index, wave) in waves.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(wave = index, "execution cancelled, not starting further waves");
                break;
            }
            debug!(wave = index, nodes = ?wave, "dispatching wave");
            self.run_wave(&workflow, &graph, wave, &mut execution, &cancel).await;
        }

        self.finish(execution, &cancel).await
    }

    /// Dispatch every runnable node of one wave and join them all.
    async fn run_wave(
        &self,
        workflow: &Workflow,
        graph: &DependencyGraph,
        wave: &[String],
        execution: &mut Execution,
        cancel: &CancellationToken,
    ) {
        let mut join_set: JoinSet<(String, NodeOutcome)> = JoinSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();

        for node_id in wave {
            // Nodes settled by an earlier attempt of this execution keep their result.
            if execution.node_status(node_id) != Some(NodeStatus::Pending) {
                continue;
            }

            if let Some(dep) = graph
                .dependencies(node_id)
                .into_iter()
                .find(|dep| execution.node_status(dep) != Some(NodeStatus::Succeeded))
            {
                let reason = format!("dependency '{dep}' did not succeed");
                self.record_node(execution, node_id, NodeResult::pending().skipped(reason)).await;
                continue;
            }

            let Some(definition) = workflow.node(node_id) else {
                continue;
            };

            let (node, config) = match self.prepare(definition, graph, execution) {
                Ok(prepared) => prepared,
                Err(e) => {
                    warn!(node_id = %node_id, error = %e, "node cannot be dispatched");
                    self.record_node(execution, node_id, NodeResult::pending().failed(e.to_string(), 0))
                        .await;
                    continue;
                }
            };

            self.record_node(execution, node_id, NodeResult::running()).await;

            let task = NodeTask {
                node,
                config,
                ctx: ExecutionContext {
                    workflow_id: workflow.id,
                    execution_id: execution.id,
                    node_id: node_id.clone(),
                    attempt: 1,
                    cancel: cancel.child_token(),
                },
                timeout: definition.timeout().unwrap_or(self.config.node_timeout),
                max_retries: self.config.max_retries,
                retry_base_delay: self.config.retry_base_delay,
            };
            in_flight.insert(node_id.clone());
            join_set.spawn(task.run());
        }

        // Wave barrier: every task must report before the next wave starts.
        while let Some(joined) = join_set.join_next().await {
            let (node_id, outcome) = match joined {
                Ok(done) => done,
                Err(join_err) => {
                    error!(error = %join_err, "node task panicked");
                    continue;
                }
            };
            in_flight.remove(&node_id);

            let running = execution
                .node_results
                .get(&node_id)
                .cloned()
                .unwrap_or_else(NodeResult::running);
            let result = match outcome {
                NodeOutcome::Succeeded { output, attempts } => {
                    info!(node_id = %node_id, attempts, "node succeeded");
                    running.succeeded(output, attempts)
                }
                NodeOutcome::Failed { error, attempts } => {
                    error!(node_id = %node_id, attempts, error = %error, "node failed");
                    running.failed(error.to_string(), attempts)
                }
                NodeOutcome::Cancelled => {
                    warn!(node_id = %node_id, "node aborted by cancellation");
                    running.skipped(CANCELLED)
                }
            };
            self.record_node(execution, &node_id, result).await;
        }

        // Tasks that panicked never reported back.
        for node_id in in_flight {
            let running = execution
                .node_results
                .get(&node_id)
                .cloned()
                .unwrap_or_else(NodeResult::running);
            let error = EngineError::Internal("node task aborted unexpectedly".into());
            self.record_node(execution, &node_id, running.failed(error.to_string(), 0)).await;
        }
    }

    /// Look up the node's implementation and resolve its configuration
    /// against the input and the outputs of its ancestors.
    fn prepare(
        &self,
        definition: &NodeDefinition,
        graph: &DependencyGraph,
        execution: &Execution,
    ) -> Result<(Arc<dyn ExecutableNode>, Value), EngineError> {
        let node_id = definition.id.as_str();
        let node_type = definition.node_type.as_str();

        let node = self.registry.get(node_type).ok_or_else(|| EngineError::NodeConfiguration {
            node_id: node_id.to_owned(),
            message: format!("no implementation registered for node_type '{node_type}'"),
        })?;

        let scope = build_scope(&execution.input, graph.ancestors(node_id), execution);
        let config = template::resolve_value(&definition.config, &scope).map_err(|e| {
            EngineError::NodeConfiguration {
                node_id: node_id.to_owned(),
                message: e.to_string(),
            }
        })?;

        Ok((node, config))
    }

    /// Settle the execution: pick the final status, skip whatever never ran,
    /// persist, notify.
    async fn finish(&self, mut execution: Execution, cancel: &CancellationToken) -> Execution {
        let cancelled = cancel.is_cancelled() || execution.status == ExecutionStatus::Cancelled;

        let unsettled: Vec<String> = execution
            .node_results
            .iter()
            .filter(|(_, r)| !r.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for node_id in unsettled {
            let current = execution.node_results[&node_id].clone();
            let reason = if cancelled { CANCELLED } else { "node was never scheduled" };
            self.record_node(&mut execution, &node_id, current.skipped(reason)).await;
        }

        let failed = execution.nodes_with_status(NodeStatus::Failed).join(", ");
        let (status, error) = if cancelled {
            (ExecutionStatus::Cancelled, None)
        } else if !failed.is_empty() {
            (ExecutionStatus::Failed, Some(format!("failed nodes: {failed}")))
        } else {
            (ExecutionStatus::Completed, None)
        };

        self.set_status(&mut execution, status, error).await;

        match execution.status {
            ExecutionStatus::Completed => info!("workflow_completed"),
            ExecutionStatus::Cancelled => warn!("workflow_cancelled"),
            _ => error!(error = ?execution.error, "workflow_failed"),
        }

        if let Some(payload) = WebhookPayload::for_execution(&execution) {
            self.webhooks.dispatch(&payload, &execution.webhooks);
        }
        execution
    }

    /// Fail an execution whose graph cannot be scheduled; no node runs.
    async fn abort_invalid(&self, mut execution: Execution, cause: EngineError) -> Execution {
        let ids: Vec<String> = execution.node_results.keys().cloned().collect();
        for node_id in ids {
            let current = execution.node_results[&node_id].clone();
            if !current.status.is_terminal() {
                self.record_node(&mut execution, &node_id, current.skipped("workflow graph is invalid"))
                    .await;
            }
        }

        let detail = format!("configuration error: {cause}");
        self.set_status(&mut execution, ExecutionStatus::Failed, Some(detail)).await;

        if let Some(payload) = WebhookPayload::for_execution(&execution) {
            self.webhooks.dispatch(&payload, &execution.webhooks);
        }
        execution
    }

    /// Apply a node transition locally, persist it, and notify subscribers
    /// when it is terminal.
    async fn record_node(&self, execution: &mut Execution, node_id: &str, result: NodeResult) {
        let update = ExecutionUpdate::Node {
            execution_id: execution.id,
            node_id: node_id.to_owned(),
            result: result.clone(),
        };
        if let Err(e) = self.store.record(update).await {
            error!(node_id = %node_id, error = %e, "failed to record node result");
        }

        let terminal = result.status.is_terminal();
        execution.node_results.insert(node_id.to_owned(), result);

        if terminal {
            if let Some(payload) = WebhookPayload::for_node(execution, node_id, &execution.node_results[node_id]) {
                self.webhooks.dispatch(&payload, &execution.webhooks);
            }
        }
    }

    /// Persist an execution status change. If the store refuses it (the
    /// execution was settled elsewhere, e.g. cancelled), adopt the stored
    /// status instead.
    async fn set_status(&self, execution: &mut Execution, status: ExecutionStatus, error: Option<String>) {
        let now = Utc::now();
        let update = ExecutionUpdate::Status {
            execution_id: execution.id,
            status,
            error: error.clone(),
            at: now,
        };

        match self.store.record(update).await {
            Ok(stored) => {
                execution.status = stored.status;
                execution.started_at = stored.started_at;
                execution.completed_at = stored.completed_at;
                execution.error = stored.error;
            }
            Err(e) => {
                warn!(%status, error = %e, "store rejected status change");
                match self.store.get_execution(execution.id).await {
                    Ok(Some(stored)) => {
                        execution.status = stored.status;
                        execution.started_at = stored.started_at;
                        execution.completed_at = stored.completed_at;
                        execution.error = stored.error;
                    }
                    _ => {
                        execution.status = status;
                        if status == ExecutionStatus::Running {
                            execution.started_at.get_or_insert(now);
                        }
                        if status.is_terminal() {
                            execution.completed_at = Some(now);
                        }
                        if error.is_some() {
                            execution.error = error;
                        }
                    }
                }
            }
        }
    }
}

/// Variables visible to a node: the execution input plus, keyed by node ID,
/// the outputs of every succeeded ancestor. Siblings and later nodes are
/// never visible.
fn build_scope(input: &Value, ancestors: Vec<&str>, execution: &Execution) -> Value {
    let mut scope: Map<String, Value> = input.as_object().cloned().unwrap_or_default();

    for ancestor in ancestors {
        if let Some(NodeResult { status: NodeStatus::Succeeded, output: Some(output), .. }) =
            execution.node_results.get(ancestor)
        {
            scope.insert(ancestor.to_owned(), output.clone());
        }
    }

    Value::Object(scope)
}

/// Everything one node task needs, owned so it can be spawned.
struct NodeTask {
    node: Arc<dyn ExecutableNode>,
    config: Value,
    ctx: ExecutionContext,
    timeout: Duration,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl NodeTask {
    #[instrument(
        name = "node_execute",
        skip_all,
        fields(execution_id = %self.ctx.execution_id, node_id = %self.ctx.node_id)
    )]
    async fn run(self) -> (String, NodeOutcome) {
        let node_id = self.ctx.node_id.clone();
        let cancel = self.ctx.cancel.clone();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => NodeOutcome::Cancelled,
            outcome = self.execute_with_retry() => outcome,
        };
        (node_id, outcome)
    }

    async fn execute_with_retry(&self) -> NodeOutcome {
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let node_id = self.ctx.node_id.clone();
            let ctx = ExecutionContext { attempt: attempts, ..self.ctx.clone() };

            let result = tokio::time::timeout(self.timeout, self.node.execute(self.config.clone(), &ctx)).await;

            let error = match result {
                Ok(Ok(output)) => return NodeOutcome::Succeeded { output, attempts },

                Err(_elapsed) => EngineError::NodeTimeout {
                    node_id,
                    timeout: self.timeout,
                },

                Ok(Err(NodeError::InvalidConfig(message))) => {
                    EngineError::NodeConfiguration { node_id, message }
                }

                Ok(Err(NodeError::Fatal(message))) => EngineError::NodeExecution { node_id, message },

                Ok(Err(NodeError::Retryable(message))) => {
                    if attempts > self.max_retries {
                        EngineError::NodeRetryExhausted { node_id, message }
                    } else {
                        let delay = backoff(self.retry_base_delay, attempts);
                        warn!(
                            "node '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                            node_id, attempts, self.max_retries, delay, message
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                }
            };

            return NodeOutcome::Failed { error, attempts };
        }
    }
}
