//! `workflow-engine` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: validate a workflow JSON file and print its wave plan.
//! - `run`: execute a workflow once and print the final execution.
//! - `ingest`: offer an event to a set of workflows and run the ones it triggers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use engine::{
    EngineConfig, Event, Execution, ExecutionManager, ExecutionStatus, WebhookConfig, WebhookEventKind,
    WebhookSubscription, Workflow,
};
use nodes::NodeRegistry;

#[derive(Parser)]
#[command(
    name = "workflow-engine",
    about = "Concurrent DAG workflow execution engine",
    version
)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct EngineArgs {
    /// Retries for a node failing with a retryable error.
    #[arg(long, global = true, env = "WORKFLOW_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,

    /// Base delay of the exponential back-off between node retries.
    #[arg(long, global = true, env = "WORKFLOW_RETRY_BASE_DELAY_MS", default_value_t = 100)]
    retry_base_delay_ms: u64,

    /// Per-node timeout, unless the node sets `timeout_ms`.
    #[arg(long, global = true, env = "WORKFLOW_NODE_TIMEOUT_MS", default_value_t = 30_000)]
    node_timeout_ms: u64,

    /// Per-request timeout for webhook deliveries.
    #[arg(long, global = true, env = "WORKFLOW_WEBHOOK_TIMEOUT_MS", default_value_t = 10_000)]
    webhook_timeout_ms: u64,

    /// Delivery attempts per webhook event.
    #[arg(long, global = true, env = "WORKFLOW_WEBHOOK_ATTEMPTS", default_value_t = 3)]
    webhook_attempts: u32,
}

impl EngineArgs {
    fn config(&self) -> EngineConfig {
        let defaults = EngineConfig::default();
        EngineConfig {
            max_retries: self.max_retries,
            retry_base_delay: Duration::from_millis(self.retry_base_delay_ms),
            node_timeout: Duration::from_millis(self.node_timeout_ms),
            webhook: WebhookConfig {
                timeout: Duration::from_millis(self.webhook_timeout_ms),
                max_attempts: self.webhook_attempts,
                ..defaults.webhook.clone()
            },
            ..defaults
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Validate a workflow definition JSON file.
    Validate {
        /// Path to the workflow JSON file.
        path: PathBuf,
    },
    /// Execute a workflow once.
    Run {
        /// Path to the workflow JSON file.
        path: PathBuf,
        /// Execution input as a JSON object.
        #[arg(long, default_value = "{}")]
        input: String,
        /// Webhook URL notified of every lifecycle event (repeatable).
        #[arg(long = "webhook")]
        webhooks: Vec<String>,
    },
    /// Offer an event to the given workflows and run every one it triggers.
    Ingest {
        /// Workflow JSON files.
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        #[arg(long)]
        source: String,
        #[arg(long)]
        status: String,
        /// Event payload as JSON.
        #[arg(long, default_value = "{}")]
        payload: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = cli.engine.config();

    match cli.command {
        Command::Validate { path } => {
            let workflow = load_workflow(&path)?;

            match engine::validate_dag(&workflow) {
                Ok(waves) => {
                    println!("✅ Workflow is valid. Waves:");
                    for (i, wave) in waves.iter().enumerate() {
                        println!("  {i}: {}", wave.join(", "));
                    }
                }
                Err(e) => {
                    eprintln!("❌ Validation failed: {e}");
                    std::process::exit(1);
                }
            }
        }

        Command::Run { path, input, webhooks } => {
            let workflow = load_workflow(&path)?;
            let input: Value = serde_json::from_str(&input).context("--input is not valid JSON")?;
            let subscriptions = webhooks.into_iter().map(subscribe_all).collect();

            let manager = Arc::new(ExecutionManager::in_memory(NodeRegistry::with_builtin(), config));
            let workflow = manager.create_workflow(workflow).await?;
            let started = manager
                .start_execution(&workflow.id.to_string(), input, subscriptions)
                .await?;
            info!(execution_id = %started.id, "execution started");

            let done = wait_or_cancel(&manager, &started.id.to_string()).await?;
            print_execution(&done)?;
            if done.status != ExecutionStatus::Completed {
                std::process::exit(1);
            }
        }

        Command::Ingest { paths, source, status, payload } => {
            let payload: Value = serde_json::from_str(&payload).context("--payload is not valid JSON")?;
            let manager = Arc::new(ExecutionManager::in_memory(NodeRegistry::with_builtin(), config));
            for path in &paths {
                manager.create_workflow(load_workflow(path)?).await?;
            }

            let started = manager.ingest_event(Event::new(source, status, payload)).await?;
            if started.is_empty() {
                warn!("event matched no workflow trigger");
                return Ok(());
            }

            let mut all_completed = true;
            for execution in started {
                let done = wait_or_cancel(&manager, &execution.id.to_string()).await?;
                all_completed &= done.status == ExecutionStatus::Completed;
                print_execution(&done)?;
            }
            if !all_completed {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn load_workflow(path: &Path) -> Result<Workflow> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("cannot read file {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("invalid workflow JSON in {}", path.display()))
}

fn subscribe_all(url: String) -> WebhookSubscription {
    WebhookSubscription::new(
        url,
        vec![
            WebhookEventKind::NodeSucceeded,
            WebhookEventKind::NodeFailed,
            WebhookEventKind::NodeSkipped,
            WebhookEventKind::ExecutionCompleted,
            WebhookEventKind::ExecutionFailed,
            WebhookEventKind::ExecutionCancelled,
        ],
    )
}

/// Wait for the execution; Ctrl-C cancels it and the wait returns once it
/// has settled.
async fn wait_or_cancel(manager: &Arc<ExecutionManager>, execution_id: &str) -> Result<Execution> {
    let interrupt = {
        let manager = manager.clone();
        let execution_id = execution_id.to_owned();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!(%execution_id, "interrupted, cancelling execution");
                if let Err(e) = manager.cancel_execution(&execution_id).await {
                    warn!(error = %e, "cancel failed");
                }
            }
        })
    };

    let done = manager.wait_execution(execution_id).await;
    interrupt.abort();
    done.with_context(|| format!("waiting for execution {execution_id}"))
}

fn print_execution(execution: &Execution) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(execution)?);
    Ok(())
}
