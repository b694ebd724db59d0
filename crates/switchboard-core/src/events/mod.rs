//! Event Bus - in-process publish/subscribe between engine components.
//!
//! Events are delivered by name. Handlers run on their own tokio tasks, so a
//! slow or failing subscriber never blocks the publisher and never reaches
//! it as an error:
//!   - `publish`: fire-and-forget, handler errors are logged
//!   - `publish_and_wait`: await every handler, collect a [`PublishReport`]
//!   - One-shot subscriptions: auto-remove after the first delivery
//!
//! Subscriptions are held in process memory only.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::models::approval::ApprovalStatus;

/// Anything that can travel on an [`EventBus`].
pub trait BusEvent: Clone + Send + Sync + 'static {
    /// Routing key subscribers register against.
    fn name(&self) -> &str;
}

pub const TASK_CREATED: &str = "task.created";
pub const TASK_COMPLETED: &str = "task.completed";
pub const TASK_FAILED: &str = "task.failed";
pub const APPROVAL_COMPLETED: &str = "approval.completed";
pub const SCORE_THRESHOLD: &str = "lead.score_threshold";
pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
/// Published as [`AgentEvent::Custom`] by the approval sweep.
pub const APPROVAL_REMINDER_DUE: &str = "approval.reminder_due";

/// Events exchanged between the queue, the gate, the engine and agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    TaskCreated {
        task_id: String,
        task_type: String,
        assigned_agent: String,
    },
    TaskCompleted {
        task_id: String,
        task_type: String,
        assigned_agent: String,
        workflow_id: Option<String>,
        workflow_step: Option<usize>,
    },
    TaskFailed {
        task_id: String,
        assigned_agent: String,
        error: String,
        attempts: u32,
        will_retry: bool,
    },
    ApprovalCompleted {
        approval_id: String,
        status: ApprovalStatus,
        related_task_id: Option<String>,
        workflow_id: Option<String>,
        workflow_step: Option<usize>,
    },
    ScoreThreshold {
        lead_id: String,
        score: f64,
        threshold: f64,
    },
    WorkflowCompleted {
        workflow_id: String,
        workflow_type: String,
    },
    /// Agent-defined event with a free-form body.
    Custom {
        name: String,
        data: serde_json::Value,
    },
}

impl BusEvent for AgentEvent {
    fn name(&self) -> &str {
        match self {
            Self::TaskCreated { .. } => TASK_CREATED,
            Self::TaskCompleted { .. } => TASK_COMPLETED,
            Self::TaskFailed { .. } => TASK_FAILED,
            Self::ApprovalCompleted { .. } => APPROVAL_COMPLETED,
            Self::ScoreThreshold { .. } => SCORE_THRESHOLD,
            Self::WorkflowCompleted { .. } => WORKFLOW_COMPLETED,
            Self::Custom { name, .. } => name,
        }
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type EventHandler<E> = Arc<dyn Fn(E) -> HandlerFuture + Send + Sync>;

pub type SubscriptionId = String;

struct Subscription<E> {
    id: SubscriptionId,
    one_shot: bool,
    handler: EventHandler<E>,
}

/// Outcome of [`EventBus::publish_and_wait`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Thread-safe event bus.
pub struct EventBus<E: BusEvent = AgentEvent> {
    subscriptions: Arc<RwLock<HashMap<String, Vec<Subscription<E>>>>>,
}

impl<E: BusEvent> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscriptions: self.subscriptions.clone(),
        }
    }
}

impl<E: BusEvent> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: BusEvent> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register `handler` for every event named `name`.
    pub async fn subscribe<F, Fut>(&self, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(name, false, handler).await
    }

    /// Register `handler` for the next event named `name` only.
    pub async fn subscribe_once<F, Fut>(&self, name: &str, handler: F) -> SubscriptionId
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(name, true, handler).await
    }

    async fn add<F, Fut>(&self, name: &str, one_shot: bool, handler: F) -> SubscriptionId
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = uuid::Uuid::new_v4().to_string();
        let handler: EventHandler<E> = Arc::new(move |event| -> HandlerFuture { Box::pin(handler(event)) });
        let mut subs = self.subscriptions.write().await;
        subs.entry(name.to_string()).or_default().push(Subscription {
            id: id.clone(),
            one_shot,
            handler,
        });
        id
    }

    /// Remove a subscription. Returns whether it existed.
    pub async fn unsubscribe(&self, name: &str, id: &str) -> bool {
        let mut subs = self.subscriptions.write().await;
        let Some(list) = subs.get_mut(name) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subs.remove(name);
        }
        removed
    }

    pub async fn handler_count(&self, name: &str) -> usize {
        self.subscriptions
            .read()
            .await
            .get(name)
            .map(|l| l.len())
            .unwrap_or(0)
    }

    /// Snapshot the handlers for `name`, dropping one-shot subscriptions.
    async fn take_handlers(&self, name: &str) -> Vec<EventHandler<E>> {
        let mut subs = self.subscriptions.write().await;
        let Some(list) = subs.get_mut(name) else {
            return Vec::new();
        };
        let handlers = list.iter().map(|s| s.handler.clone()).collect();
        list.retain(|s| !s.one_shot);
        if list.is_empty() {
            subs.remove(name);
        }
        handlers
    }

    /// Fire-and-forget delivery. Returns once every handler has been spawned.
    pub async fn publish(&self, event: E) {
        let name = event.name().to_string();
        let handlers = self.take_handlers(&name).await;
        tracing::debug!("[EventBus] publish '{}' to {} handler(s)", name, handlers.len());

        for handler in handlers {
            let event = event.clone();
            let name = name.clone();
            tokio::spawn(async move {
                if let Err(e) = handler(event).await {
                    tracing::error!("[EventBus] Handler for '{}' failed: {:#}", name, e);
                }
            });
        }
    }

    /// Deliver to every handler concurrently and wait for all of them.
    /// Failures and panics are logged and counted, never propagated.
    pub async fn publish_and_wait(&self, event: E) -> PublishReport {
        let name = event.name().to_string();
        let handlers = self.take_handlers(&name).await;

        let joins: Vec<_> = handlers
            .into_iter()
            .map(|handler| {
                let event = event.clone();
                tokio::spawn(async move { handler(event).await })
            })
            .collect();

        let mut report = PublishReport::default();
        for join in joins {
            match join.await {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    tracing::error!("[EventBus] Handler for '{}' failed: {:#}", name, e);
                }
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("[EventBus] Handler for '{}' panicked: {}", name, e);
                }
            }
        }
        tracing::debug!(
            "[EventBus] '{}' delivered={} failed={}",
            name,
            report.delivered,
            report.failed
        );
        report
    }
}
