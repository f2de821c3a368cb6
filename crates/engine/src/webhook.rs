//! Webhook dispatch.
//!
//! The executor hands lifecycle events to a [`WebhookDispatcher`], which
//! selects the interested subscriptions and queues one delivery per
//! subscription on an unbounded channel. A background task drains the
//! channel and delivers through a [`WebhookDeliverer`]. Delivery is
//! fire-and-forget: failures are logged and never reach the execution.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{backoff, WebhookConfig};
use crate::models::{Execution, NodeResult, WebhookEventKind, WebhookSubscription};

/// Body POSTed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: WebhookEventKind,
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    /// Status of the node or execution the event is about.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WebhookPayload {
    /// Payload for a node that reached a terminal status.
    pub fn for_node(execution: &Execution, node_id: &str, result: &NodeResult) -> Option<Self> {
        let event = WebhookEventKind::for_node(result.status)?;
        Some(Self {
            event,
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            node_id: Some(node_id.to_owned()),
            status: result.status.to_string(),
            output: result.output.clone(),
            error: result.error.clone(),
            timestamp: Utc::now(),
        })
    }

    /// Payload for an execution that reached a terminal status.
    pub fn for_execution(execution: &Execution) -> Option<Self> {
        let event = WebhookEventKind::for_execution(execution.status)?;
        Some(Self {
            event,
            execution_id: execution.id,
            workflow_id: execution.workflow_id,
            node_id: None,
            status: execution.status.to_string(),
            output: None,
            error: execution.error.clone(),
            timestamp: Utc::now(),
        })
    }
}

impl WebhookSubscription {
    /// Whether this subscription wants `event`. The node restriction only
    /// applies to node events.
    pub fn wants(&self, event: WebhookEventKind, node_id: Option<&str>) -> bool {
        if !self.events.contains(&event) {
            return false;
        }
        match (&self.node_ids, node_id) {
            (Some(allowed), Some(node_id)) if event.is_node_event() => {
                allowed.iter().any(|id| id == node_id)
            }
            _ => true,
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("delivery to {url} failed after {attempts} attempt(s): {message}")]
    Delivery {
        url: String,
        attempts: u32,
        message: String,
    },
}

/// Transport for a single webhook delivery.
#[async_trait]
pub trait WebhookDeliverer: Send + Sync {
    async fn deliver(
        &self,
        payload: &WebhookPayload,
        subscription: &WebhookSubscription,
    ) -> Result<(), WebhookError>;
}

/// POSTs the payload as JSON, retrying with exponential back-off.
#[derive(Debug, Clone)]
pub struct HttpDeliverer {
    client: Client,
    config: WebhookConfig,
}

impl HttpDeliverer {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            client: Client::new(),
            config,
        }
    }

    async fn attempt(
        &self,
        payload: &WebhookPayload,
        subscription: &WebhookSubscription,
    ) -> Result<(), String> {
        let mut request = self
            .client
            .post(&subscription.url)
            .timeout(self.config.timeout)
            .header("X-Webhook-Event", payload.event.name())
            .json(payload);
        for (key, value) in &subscription.headers {
            request = request.header(key, value);
        }

        let response = request.send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("subscriber answered {}", response.status()))
        }
    }
}

#[async_trait]
impl WebhookDeliverer for HttpDeliverer {
    async fn deliver(
        &self,
        payload: &WebhookPayload,
        subscription: &WebhookSubscription,
    ) -> Result<(), WebhookError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.attempt(payload, subscription).await {
                Ok(()) => return Ok(()),
                Err(message) if attempts >= max_attempts => {
                    return Err(WebhookError::Delivery {
                        url: subscription.url.clone(),
                        attempts,
                        message,
                    });
                }
                Err(message) => {
                    let delay = backoff(self.config.retry_base_delay, attempts);
                    debug!(
                        url = %subscription.url,
                        attempt = attempts,
                        ?delay,
                        "webhook delivery failed, retrying: {message}"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

struct Delivery {
    payload: WebhookPayload,
    subscription: WebhookSubscription,
}

/// Fans lifecycle events out to interested subscriptions.
#[derive(Clone)]
pub struct WebhookDispatcher {
    sender: mpsc::UnboundedSender<Delivery>,
}

impl WebhookDispatcher {
    /// Start the background delivery task. Must be called inside a tokio
    /// runtime; the task ends once every dispatcher clone is dropped.
    pub fn spawn(deliverer: Arc<dyn WebhookDeliverer>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Delivery>();

        tokio::spawn(async move {
            while let Some(delivery) = receiver.recv().await {
                let deliverer = deliverer.clone();
                // Each delivery runs on its own so a slow subscriber cannot
                // hold up the others.
                tokio::spawn(async move {
                    let Delivery { payload, subscription } = delivery;
                    if let Err(e) = deliverer.deliver(&payload, &subscription).await {
                        warn!(
                            execution_id = %payload.execution_id,
                            event = %payload.event,
                            error = %e,
                            "webhook delivery failed"
                        );
                    }
                });
            }
        });

        Self { sender }
    }

    /// Queue `payload` for every subscription that wants it. Returns the
    /// number of deliveries queued.
    pub fn dispatch(&self, payload: &WebhookPayload, subscriptions: &[WebhookSubscription]) -> usize {
        let mut queued = 0;
        for subscription in subscriptions
            .iter()
            .filter(|s| s.wants(payload.event, payload.node_id.as_deref()))
        {
            let delivery = Delivery {
                payload: payload.clone(),
                subscription: subscription.clone(),
            };
            // The receiver only disappears when the runtime shuts down.
            if self.sender.send(delivery).is_ok() {
                queued += 1;
            }
        }
        queued
    }
}

impl std::fmt::Debug for WebhookDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookDispatcher").finish_non_exhaustive()
    }
}
