//! Approval gate: persisted human checkpoints that block workflow progress
//! until a reviewer decides.

use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::events::{AgentEvent, EventBus};
use crate::models::approval::{ApprovalItem, ApprovalStatus, NewApproval};
use crate::models::payload::Payload;
use crate::models::task::{PRIORITY_HIGHEST, PRIORITY_LOWEST};
use crate::store::{ApprovalStore, TaskStore};

#[derive(Clone)]
pub struct ApprovalGate {
    store: ApprovalStore,
    tasks: TaskStore,
    event_bus: EventBus,
}

impl ApprovalGate {
    pub fn new(store: ApprovalStore, tasks: TaskStore, event_bus: EventBus) -> Self {
        Self {
            store,
            tasks,
            event_bus,
        }
    }

    pub async fn create_approval(&self, input: NewApproval) -> Result<ApprovalItem, CoreError> {
        if input.title.trim().is_empty() {
            return Err(CoreError::BadRequest("Approval title must not be empty".to_string()));
        }
        if !(PRIORITY_HIGHEST..=PRIORITY_LOWEST).contains(&input.priority) {
            return Err(CoreError::BadRequest(format!(
                "Priority must be between {} and {}, got {}",
                PRIORITY_HIGHEST, PRIORITY_LOWEST, input.priority
            )));
        }

        let now = Utc::now();
        let item = ApprovalItem {
            id: uuid::Uuid::new_v4().to_string(),
            approval_type: input.approval_type,
            status: ApprovalStatus::Pending,
            priority: input.priority,
            title: input.title,
            summary: input.summary,
            content: input.content,
            created_by: input.created_by,
            reviewed_by: None,
            reviewed_at: None,
            feedback: None,
            related_task_id: input.related_task_id,
            reminder_sent_at: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert(&item).await?;
        tracing::info!(approval_id = %item.id, "[ApprovalGate] Awaiting review: {}", item.title);
        Ok(item)
    }

    pub async fn get(&self, id: &str) -> Result<ApprovalItem, CoreError> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Approval {} not found", id)))
    }

    pub async fn list_pending(&self) -> Result<Vec<ApprovalItem>, CoreError> {
        self.store.list_pending().await
    }

    /// Record a reviewer decision and wait for every `ApprovalCompleted`
    /// subscriber. The event carries the workflow coordinates of the
    /// related task, if it has any.
    pub async fn resolve(
        &self,
        id: &str,
        status: ApprovalStatus,
        reviewed_by: &str,
        feedback: Option<String>,
    ) -> Result<ApprovalItem, CoreError> {
        if !status.is_decision() {
            return Err(CoreError::BadRequest(format!(
                "Cannot resolve approval {} to '{}'",
                id,
                status.as_str()
            )));
        }

        let item = self.store.resolve(id, status, reviewed_by, feedback).await?;
        tracing::info!(
            approval_id = %item.id,
            reviewer = reviewed_by,
            "[ApprovalGate] Resolved as {}",
            status.as_str()
        );

        let (workflow_id, workflow_step) = match &item.related_task_id {
            Some(task_id) => match self.tasks.get(task_id).await? {
                Some(task) => (task.workflow_id().map(str::to_string), task.workflow_step()),
                None => {
                    tracing::warn!(
                        approval_id = %item.id,
                        "[ApprovalGate] Related task {} not found",
                        task_id
                    );
                    (None, None)
                }
            },
            None => (None, None),
        };

        self.event_bus
            .publish_and_wait(AgentEvent::ApprovalCompleted {
                approval_id: item.id.clone(),
                status,
                related_task_id: item.related_task_id.clone(),
                workflow_id,
                workflow_step,
            })
            .await;
        Ok(item)
    }

    /// Pending items older than `older_than` that have not been reminded.
    /// Sending the reminder and calling [`record_reminder`](Self::record_reminder)
    /// is up to the caller.
    pub async fn sweep_needs_reminder(&self, older_than: chrono::Duration) -> Result<Vec<ApprovalItem>, CoreError> {
        let cutoff = Utc::now().checked_sub_signed(older_than).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let items = self.store.needs_reminder(cutoff).await?;
        for item in &items {
            tracing::warn!(
                approval_id = %item.id,
                "[ApprovalGate] Awaiting review since {}: {}",
                item.created_at,
                item.title
            );
        }
        Ok(items)
    }

    pub async fn record_reminder(&self, id: &str) -> Result<ApprovalItem, CoreError> {
        self.store.record_reminder(id).await
    }

    /// Return a `revision_requested` item to the queue, optionally with
    /// revised content.
    pub async fn resubmit(&self, id: &str, content: Option<Payload>) -> Result<ApprovalItem, CoreError> {
        let item = self.store.resubmit(id, content).await?;
        tracing::info!(approval_id = %item.id, "[ApprovalGate] Resubmitted for review");
        Ok(item)
    }
}
