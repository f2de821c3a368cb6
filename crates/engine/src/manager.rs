//! Execution manager: the public operations of the engine.
//!
//! Owns the store, the executor and the handles of in-flight runs. Every
//! identifier arrives as a string and is parsed here, so callers never deal
//! with UUID parsing themselves.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use nodes::NodeRegistry;

use crate::config::EngineConfig;
use crate::dag::{validate_dag, DependencyGraph};
use crate::executor::WorkflowExecutor;
use crate::models::{Event, Execution, ExecutionStatus, NodeResult, NodeStatus, Workflow, WebhookSubscription};
use crate::store::{ExecutionFilter, ExecutionPage, ExecutionStore, ExecutionUpdate, MemoryStore, StoreError};
use crate::webhook::{HttpDeliverer, WebhookDeliverer, WebhookDispatcher};
use crate::EngineError;

/// Query for [`ExecutionManager::list_executions`]. Unset fields do not
/// filter; an unset `limit` falls back to the configured page size.
#[derive(Debug, Clone, Default)]
pub struct ListExecutionsQuery {
    pub workflow_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

struct RunHandle {
    cancel: CancellationToken,
    /// Holds the final execution once the run has settled.
    done: watch::Receiver<Option<Execution>>,
}

impl RunHandle {
    fn is_finished(&self) -> bool {
        self.done.borrow().is_some() || self.done.has_changed().is_err()
    }
}

pub struct ExecutionManager {
    store: Arc<dyn ExecutionStore>,
    executor: Arc<WorkflowExecutor>,
    config: EngineConfig,
    running: Mutex<HashMap<Uuid, RunHandle>>,
}

impl ExecutionManager {
    /// Build a manager around an existing store and webhook deliverer. Must
    /// be called inside a Tokio runtime (the webhook dispatcher spawns its
    /// worker).
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        registry: NodeRegistry,
        deliverer: Arc<dyn WebhookDeliverer>,
        config: EngineConfig,
    ) -> Self {
        let dispatcher = WebhookDispatcher::spawn(deliverer);
        let executor = Arc::new(WorkflowExecutor::new(
            store.clone(),
            Arc::new(registry),
            dispatcher,
            config.clone(),
        ));
        Self {
            store,
            executor,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// In-memory store and HTTP webhook delivery.
    pub fn in_memory(registry: NodeRegistry, config: EngineConfig) -> Self {
        let deliverer = Arc::new(HttpDeliverer::new(config.webhook.clone()));
        Self::new(Arc::new(MemoryStore::new()), registry, deliverer, config)
    }

    // -----------------------------------------------------------------------
    // Workflows
    // -----------------------------------------------------------------------

    /// Validate and store a workflow definition.
    #[instrument(skip_all, fields(workflow_id = %workflow.id, name = %workflow.name))]
    pub async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow, EngineError> {
        validate_workflow(&workflow)?;

        match self.store.insert_workflow(workflow.clone()).await {
            Ok(()) => {
                info!(nodes = workflow.nodes.len(), "workflow created");
                Ok(workflow)
            }
            Err(StoreError::Conflict(_)) => Err(EngineError::WorkflowExists(workflow.id)),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, EngineError> {
        let id = parse_id(workflow_id)?;
        self.store
            .get_workflow(id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(id))
    }

    pub async fn list_workflows(&self) -> Result<Vec<Workflow>, EngineError> {
        Ok(self.store.list_workflows().await?)
    }

    // -----------------------------------------------------------------------
    // Executions
    // -----------------------------------------------------------------------

    /// Create a `Pending` execution and start running it in the background.
    ///
    /// Returns as soon as the execution is stored; use
    /// [`Self::wait_execution`] or poll [`Self::get_execution`] to observe
    /// progress.
    #[instrument(skip(self, input, webhooks))]
    pub async fn start_execution(
        &self,
        workflow_id: &str,
        input: Value,
        webhooks: Vec<WebhookSubscription>,
    ) -> Result<Execution, EngineError> {
        let id = parse_id(workflow_id)?;
        let workflow = self
            .store
            .get_workflow(id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(id))?;

        let input = match input {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            _ => return Err(EngineError::ValidationFailed("execution input must be a JSON object".into())),
        };
        for subscription in &webhooks {
            validate_subscription(subscription, &workflow)?;
        }

        let execution = Execution::new(&workflow, input, webhooks);
        let (cancel, done) = self.register_run(execution.id).await;
        if let Err(e) = self.store.insert_execution(&execution).await {
            self.running.lock().await.remove(&execution.id);
            return Err(e.into());
        }
        info!(execution_id = %execution.id, "execution created");

        self.spawn_run(Arc::new(workflow), execution.clone(), cancel, done);
        Ok(execution)
    }

    pub async fn get_execution(&self, execution_id: &str) -> Result<Execution, EngineError> {
        let id = parse_id(execution_id)?;
        self.load_execution(id).await
    }

    /// Page through executions, newest first.
    pub async fn list_executions(&self, query: ListExecutionsQuery) -> Result<ExecutionPage, EngineError> {
        let workflow_id = query.workflow_id.as_deref().map(parse_id).transpose()?;
        let filter = ExecutionFilter {
            workflow_id,
            status: query.status,
            limit: query.limit.unwrap_or(self.config.default_page_limit),
            offset: query.offset.unwrap_or(0),
        };
        Ok(self.store.list_executions(&filter).await?)
    }

    /// Cancel a non-terminal execution. Nodes already running are aborted
    /// and recorded as skipped; no further waves start.
    #[instrument(skip(self))]
    pub async fn cancel_execution(&self, execution_id: &str) -> Result<Execution, EngineError> {
        let id = parse_id(execution_id)?;
        let execution = self.load_execution(id).await?;
        if execution.status.is_terminal() {
            return Err(EngineError::ValidationFailed(format!(
                "execution {id} is already {}",
                execution.status
            )));
        }

        if let Some(run) = self.running.lock().await.get(&id) {
            run.cancel.cancel();
        }

        let update = ExecutionUpdate::Status {
            execution_id: id,
            status: ExecutionStatus::Cancelled,
            error: None,
            at: chrono::Utc::now(),
        };
        match self.store.record(update).await {
            Ok(cancelled) => {
                info!("execution cancelled");
                Ok(cancelled)
            }
            Err(StoreError::InvalidTransition { from, .. }) => Err(EngineError::ValidationFailed(format!(
                "execution {id} is already {from}"
            ))),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-run a failed execution. Failed and skipped nodes, and everything
    /// downstream of them, run again; succeeded nodes keep their outputs.
    #[instrument(skip(self))]
    pub async fn retry_execution(&self, execution_id: &str) -> Result<Execution, EngineError> {
        let id = parse_id(execution_id)?;
        let mut execution = self.load_execution(id).await?;
        if execution.status != ExecutionStatus::Failed {
            return Err(EngineError::ValidationFailed(format!(
                "only failed executions can be retried, execution {id} is {}",
                execution.status
            )));
        }

        let workflow = self
            .store
            .get_workflow(execution.workflow_id)
            .await?
            .ok_or(EngineError::WorkflowNotFound(execution.workflow_id))?;
        let graph = DependencyGraph::build(&workflow)?;

        let unsettled: Vec<&str> = execution
            .node_results
            .iter()
            .filter(|(_, r)| matches!(r.status, NodeStatus::Failed | NodeStatus::Skipped))
            .map(|(id, _)| id.as_str())
            .collect();
        let rerun: HashSet<String> = unsettled
            .iter()
            .copied()
            .chain(graph.descendants(unsettled.iter().copied()))
            .map(str::to_owned)
            .collect();

        for node_id in &rerun {
            execution.node_results.insert(node_id.clone(), NodeResult::pending());
        }
        execution.status = ExecutionStatus::Pending;
        execution.error = None;
        execution.started_at = None;
        execution.completed_at = None;
        execution.retry_count += 1;

        let (cancel, done) = self.register_run(id).await;
        if let Err(e) = self.store.save_execution(&execution).await {
            self.running.lock().await.remove(&id);
            return Err(e.into());
        }
        info!(nodes = rerun.len(), retry = execution.retry_count, "execution retried");

        self.spawn_run(Arc::new(workflow), execution.clone(), cancel, done);
        Ok(execution)
    }

    /// Start one execution for every workflow with a trigger matching the
    /// event. The payload becomes the execution input; a non-object payload
    /// is exposed under `payload`.
    #[instrument(skip_all, fields(source = %event.source, status = %event.status))]
    pub async fn ingest_event(&self, event: Event) -> Result<Vec<Execution>, EngineError> {
        let input = match event.payload {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            other => {
                let mut map = Map::new();
                map.insert("payload".to_owned(), other);
                Value::Object(map)
            }
        };

        let event = Event { payload: input, ..event };
        let mut started = Vec::new();
        for workflow in self.store.list_workflows().await? {
            if !workflow.is_triggered_by(&event) {
                continue;
            }
            match self
                .start_execution(&workflow.id.to_string(), event.payload.clone(), Vec::new())
                .await
            {
                Ok(execution) => started.push(execution),
                Err(e) => warn!(workflow_id = %workflow.id, error = %e, "failed to start triggered workflow"),
            }
        }

        debug!(started = started.len(), "event ingested");
        Ok(started)
    }

    /// Wait for a background run to finish and return the final execution.
    /// Any number of callers may wait on the same run. Returns the stored
    /// state when nothing is running.
    pub async fn wait_execution(&self, execution_id: &str) -> Result<Execution, EngineError> {
        let id = parse_id(execution_id)?;
        let done = self.running.lock().await.get(&id).map(|run| run.done.clone());

        let Some(mut done) = done else {
            return self.load_execution(id).await;
        };
        let finished = match done.wait_for(Option::is_some).await {
            Ok(value) => value.clone(),
            Err(_) => None,
        };
        finished.ok_or_else(|| EngineError::Internal(format!("execution {id} task ended without a result")))
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn load_execution(&self, id: Uuid) -> Result<Execution, EngineError> {
        self.store
            .get_execution(id)
            .await?
            .ok_or(EngineError::ExecutionNotFound(id))
    }

    /// Track a run before its execution is written, so any cancel that can
    /// see the execution also finds the token.
    async fn register_run(&self, id: Uuid) -> (CancellationToken, watch::Sender<Option<Execution>>) {
        let cancel = CancellationToken::new();
        let (done_tx, done) = watch::channel(None);

        let mut running = self.running.lock().await;
        running.retain(|_, run| !run.is_finished());
        running.insert(id, RunHandle { cancel: cancel.clone(), done });
        (cancel, done_tx)
    }

    fn spawn_run(
        &self,
        workflow: Arc<Workflow>,
        execution: Execution,
        cancel: CancellationToken,
        done: watch::Sender<Option<Execution>>,
    ) {
        let executor = self.executor.clone();
        tokio::spawn(async move {
            let finished = executor.run(workflow, execution, cancel).await;
            done.send_replace(Some(finished));
        });
    }
}

impl std::fmt::Debug for ExecutionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Parse a string identifier.
pub fn parse_id(raw: &str) -> Result<Uuid, EngineError> {
    Uuid::parse_str(raw.trim()).map_err(|_| EngineError::InvalidId(raw.to_owned()))
}

fn validate_workflow(workflow: &Workflow) -> Result<(), EngineError> {
    if workflow.name.trim().is_empty() {
        return Err(EngineError::ValidationFailed("workflow name must not be empty".into()));
    }
    for node in &workflow.nodes {
        if node.id.trim().is_empty() {
            return Err(EngineError::ValidationFailed("node id must not be empty".into()));
        }
        if node.node_type.trim().is_empty() {
            return Err(EngineError::ValidationFailed(format!(
                "node '{}' has an empty node_type",
                node.id
            )));
        }
    }
    for trigger in &workflow.triggers {
        if trigger.source.is_empty() || trigger.status.is_empty() {
            return Err(EngineError::ValidationFailed(
                "trigger source and status must not be empty".into(),
            ));
        }
    }
    validate_dag(workflow)?;
    Ok(())
}

fn validate_subscription(subscription: &WebhookSubscription, workflow: &Workflow) -> Result<(), EngineError> {
    let url = reqwest::Url::parse(&subscription.url)
        .map_err(|e| EngineError::ValidationFailed(format!("invalid webhook url '{}': {e}", subscription.url)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(EngineError::ValidationFailed(format!(
            "webhook url '{}' must use http or https",
            subscription.url
        )));
    }
    if subscription.events.is_empty() {
        return Err(EngineError::ValidationFailed(format!(
            "webhook '{}' subscribes to no events",
            subscription.url
        )));
    }
    if let Some(node_ids) = &subscription.node_ids {
        if let Some(unknown) = node_ids.iter().find(|id| workflow.node(id).is_none()) {
            return Err(EngineError::ValidationFailed(format!(
                "webhook '{}' references unknown node '{unknown}'",
                subscription.url
            )));
        }
    }
    Ok(())
}
