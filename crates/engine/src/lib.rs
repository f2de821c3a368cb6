//! `engine` crate: workflow model, DAG validation, trigger matching,
//! template resolution and the concurrent execution engine.

pub mod config;
pub mod error;
pub mod models;
pub mod dag;
pub mod template;
pub mod trigger;
pub mod store;
pub mod webhook;
pub mod executor;
pub mod manager;

pub use config::{EngineConfig, WebhookConfig};
pub use error::{EngineError, ErrorKind};
pub use models::{
    Event, Execution, ExecutionStatus, NodeDefinition, NodeResult, NodeStatus, Trigger, WebhookEventKind,
    WebhookSubscription, Workflow,
};
pub use dag::validate_dag;
pub use store::{ExecutionStore, MemoryStore, StoreError};
pub use webhook::{HttpDeliverer, WebhookDeliverer, WebhookPayload};
pub use executor::WorkflowExecutor;
pub use manager::{ExecutionManager, ListExecutionsQuery};
