//! Task queue: typed access and status transitions over `AgentTask`,
//! plus the generic agent run loop built on top of them.

use std::future::Future;

use chrono::Utc;

use crate::config::RetryPolicy;
use crate::error::CoreError;
use crate::events::{AgentEvent, EventBus};
use crate::models::payload::Payload;
use crate::models::task::{AgentRole, AgentTask, NewTask, TaskStatus, PRIORITY_HIGHEST, PRIORITY_LOWEST};
use crate::store::TaskStore;

/// Outcome of one pass over an agent's pending tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleReport {
    pub processed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct TaskQueue {
    store: TaskStore,
    event_bus: EventBus,
    retry: RetryPolicy,
}

impl TaskQueue {
    pub fn new(store: TaskStore, event_bus: EventBus, retry: RetryPolicy) -> Self {
        Self {
            store,
            event_bus,
            retry,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Validate and persist a new pending task, then announce it.
    pub async fn create_task(&self, input: NewTask) -> Result<AgentTask, CoreError> {
        let task = build_task(input)?;
        self.store.insert(&task).await?;
        tracing::info!(
            task_id = %task.id,
            agent = task.assigned_agent.as_str(),
            "[TaskQueue] Created {} task",
            task.task_type
        );
        self.announce_created(&task).await;
        Ok(task)
    }

    /// Publish `TaskCreated` for a task persisted by someone else
    /// (e.g. a workflow step inserted inside the engine's transaction).
    pub async fn announce_created(&self, task: &AgentTask) {
        self.event_bus
            .publish(AgentEvent::TaskCreated {
                task_id: task.id.clone(),
                task_type: task.task_type.to_string(),
                assigned_agent: task.assigned_agent.to_string(),
            })
            .await;
    }

    pub async fn fetch_pending(&self, agent: AgentRole) -> Result<Vec<AgentTask>, CoreError> {
        self.store.fetch_pending(agent, Utc::now()).await
    }

    pub async fn get(&self, task_id: &str) -> Result<AgentTask, CoreError> {
        self.store
            .get(task_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Task {} not found", task_id)))
    }

    pub async fn list(
        &self,
        agent: Option<AgentRole>,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<AgentTask>, CoreError> {
        self.store.list(agent, status, limit).await
    }

    pub async fn mark_in_progress(&self, task_id: &str) -> Result<AgentTask, CoreError> {
        self.store.mark_in_progress(task_id).await
    }

    /// Complete a task and wait for completion subscribers; workflow
    /// continuation hangs off this signal so it must not be dropped.
    pub async fn mark_complete(&self, task_id: &str, result: Payload) -> Result<AgentTask, CoreError> {
        let task = self.store.mark_complete(task_id, result).await?;
        tracing::info!(task_id = %task.id, agent = task.assigned_agent.as_str(), "[TaskQueue] Task complete");
        self.event_bus
            .publish_and_wait(AgentEvent::TaskCompleted {
                task_id: task.id.clone(),
                task_type: task.task_type.to_string(),
                assigned_agent: task.assigned_agent.to_string(),
                workflow_id: task.workflow_id().map(str::to_string),
                workflow_step: task.workflow_step(),
            })
            .await;
        Ok(task)
    }

    /// Record a failed attempt under the configured retry policy.
    pub async fn mark_failed(&self, task_id: &str, error: &str) -> Result<AgentTask, CoreError> {
        let policy = self.retry;
        self.fail_with(task_id, error, &policy).await
    }

    /// Record a failure that retrying cannot fix.
    pub async fn mark_failed_terminal(&self, task_id: &str, error: &str) -> Result<AgentTask, CoreError> {
        self.fail_with(task_id, error, &RetryPolicy::no_retry()).await
    }

    async fn fail_with(&self, task_id: &str, error: &str, policy: &RetryPolicy) -> Result<AgentTask, CoreError> {
        let task = self.store.mark_failed(task_id, error, policy).await?;
        let will_retry = task.status == TaskStatus::Pending;
        if will_retry {
            tracing::warn!(
                task_id = %task.id,
                attempts = task.attempts,
                "[TaskQueue] Task failed, retrying after backoff: {}",
                error
            );
        } else {
            tracing::error!(
                task_id = %task.id,
                attempts = task.attempts,
                "[TaskQueue] Task failed permanently: {}",
                error
            );
        }
        self.event_bus
            .publish(AgentEvent::TaskFailed {
                task_id: task.id.clone(),
                assigned_agent: task.assigned_agent.to_string(),
                error: error.to_string(),
                attempts: task.attempts,
                will_retry,
            })
            .await;
        Ok(task)
    }

    /// Pull `agent`'s pending tasks in queue order and run each through
    /// `handler` on its own tokio task. Handler errors and panics are
    /// recorded on the task, never returned; a `CoreError` that is not
    /// retryable fails the task immediately.
    pub async fn run_cycle<F, Fut>(&self, agent: AgentRole, handler: F) -> Result<CycleReport, CoreError>
    where
        F: Fn(AgentTask) -> Fut,
        Fut: Future<Output = anyhow::Result<Payload>> + Send + 'static,
    {
        let mut report = CycleReport::default();
        for task in self.fetch_pending(agent).await? {
            let task = match self.mark_in_progress(&task.id).await {
                Ok(task) => task,
                // Claimed by a concurrent cycle in between.
                Err(CoreError::Conflict(_)) => continue,
                Err(e) => return Err(e),
            };
            let task_id = task.id.clone();
            match tokio::spawn(handler(task)).await {
                Ok(Ok(result)) => {
                    self.mark_complete(&task_id, result).await?;
                    report.processed += 1;
                }
                Ok(Err(e)) => {
                    let message = format!("{:#}", e);
                    let permanent = e
                        .downcast_ref::<CoreError>()
                        .is_some_and(|ce| !ce.is_retryable());
                    if permanent {
                        self.mark_failed_terminal(&task_id, &message).await?;
                    } else {
                        self.mark_failed(&task_id, &message).await?;
                    }
                    report.failed += 1;
                }
                Err(e) => {
                    tracing::error!(task_id = %task_id, "[TaskQueue] Handler panicked: {}", e);
                    self.mark_failed(&task_id, &format!("panicked: {}", e)).await?;
                    report.failed += 1;
                }
            }
        }
        if report.processed + report.failed > 0 {
            tracing::info!(
                agent = agent.as_str(),
                "[TaskQueue] Cycle done: processed={} failed={}",
                report.processed,
                report.failed
            );
        }
        Ok(report)
    }
}

/// Check a task request and turn it into a pending row.
pub(crate) fn build_task(input: NewTask) -> Result<AgentTask, CoreError> {
    if !(PRIORITY_HIGHEST..=PRIORITY_LOWEST).contains(&input.priority) {
        return Err(CoreError::BadRequest(format!(
            "Priority must be between {} and {}, got {}",
            PRIORITY_HIGHEST, PRIORITY_LOWEST, input.priority
        )));
    }
    if input.task_type.as_str().trim().is_empty() {
        return Err(CoreError::BadRequest("Task type must not be empty".to_string()));
    }
    let mut task = AgentTask::new(
        input.assigned_agent,
        input.task_type,
        input.payload,
        input.priority,
        &input.created_by,
    );
    task.due_at = input.due_at;
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::events::{TASK_COMPLETED, TASK_CREATED};
    use crate::models::task::TaskType;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn queue_with(retry: RetryPolicy) -> (TaskQueue, EventBus) {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        (TaskQueue::new(TaskStore::new(db), bus.clone(), retry), bus)
    }

    #[tokio::test]
    async fn test_create_task_publishes_created_event() {
        let (queue, bus) = queue_with(RetryPolicy::default());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        bus.subscribe(TASK_CREATED, move |event| {
            let tx = tx.clone();
            async move {
                if let AgentEvent::TaskCreated { task_id, task_type, assigned_agent } = event {
                    tx.send((task_id, task_type, assigned_agent))?;
                }
                anyhow::Ok(())
            }
        })
        .await;

        let task = queue
            .create_task(NewTask::new(AgentRole::Seo, TaskType::CreateContentBrief, Payload::empty()))
            .await
            .unwrap();
        assert_eq!(task.priority, 3);
        assert_eq!(task.created_by, "orchestrator");

        let (id, task_type, agent) = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, task.id);
        assert_eq!(task_type, "create_content_brief");
        assert_eq!(agent, "seo");
    }

    #[tokio::test]
    async fn test_create_task_rejects_out_of_range_priority() {
        let (queue, _) = queue_with(RetryPolicy::default());
        for priority in [0, 6] {
            let err = queue
                .create_task(
                    NewTask::new(AgentRole::Content, TaskType::WriteBlogPost, Payload::empty())
                        .with_priority(priority),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, CoreError::BadRequest(_)));
        }
    }

    async fn analytics_handler(task: AgentTask) -> anyhow::Result<Payload> {
        if task.task_type == TaskType::Custom("bogus".into()) {
            return Err(CoreError::Config("unsupported task type".into()).into());
        }
        if task.payload.get("ok") == Some(&json!(true)) {
            Ok(Payload::new(json!({ "sessions": 42 })))
        } else {
            anyhow::bail!("analytics API timeout")
        }
    }

    #[tokio::test]
    async fn test_run_cycle_completes_and_fails_tasks() {
        let (queue, bus) = queue_with(RetryPolicy::default());
        let completed = Arc::new(AtomicUsize::new(0));
        let c = completed.clone();
        bus.subscribe(TASK_COMPLETED, move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                anyhow::Ok(())
            }
        })
        .await;

        let ok = queue
            .create_task(NewTask::new(AgentRole::Analytics, TaskType::CompileMetrics, Payload::new(json!({ "ok": true }))))
            .await
            .unwrap();
        let flaky = queue
            .create_task(NewTask::new(AgentRole::Analytics, TaskType::CompileMetrics, Payload::new(json!({ "ok": false }))))
            .await
            .unwrap();
        let broken = queue
            .create_task(NewTask::new(AgentRole::Analytics, TaskType::Custom("bogus".into()), Payload::empty()))
            .await
            .unwrap();

        let report = queue.run_cycle(AgentRole::Analytics, analytics_handler).await.unwrap();
        assert_eq!(report, CycleReport { processed: 1, failed: 2 });
        assert_eq!(completed.load(Ordering::SeqCst), 1);

        let ok = queue.get(&ok.id).await.unwrap();
        assert_eq!(ok.status, TaskStatus::Complete);
        assert_eq!(ok.result.unwrap().get("sessions"), Some(&json!(42)));

        let flaky = queue.get(&flaky.id).await.unwrap();
        assert_eq!(flaky.status, TaskStatus::Pending);
        assert_eq!(flaky.attempts, 1);
        assert_eq!(flaky.last_error.as_deref(), Some("analytics API timeout"));

        let broken = queue.get(&broken.id).await.unwrap();
        assert_eq!(broken.status, TaskStatus::Failed);
        assert_eq!(broken.attempts, 1);

        // The retried task is behind its backoff, so nothing runs now.
        let again = queue
            .run_cycle(AgentRole::Analytics, |_| async { anyhow::Ok(Payload::empty()) })
            .await
            .unwrap();
        assert_eq!(again, CycleReport::default());
    }

    #[tokio::test]
    async fn test_run_cycle_records_handler_panic_and_continues() {
        let (queue, _) = queue_with(RetryPolicy::default());
        let crashing = queue
            .create_task(
                NewTask::new(AgentRole::Analytics, TaskType::Custom("crash".into()), Payload::empty()).with_priority(1),
            )
            .await
            .unwrap();
        let fine = queue
            .create_task(NewTask::new(AgentRole::Analytics, TaskType::CompileMetrics, Payload::empty()))
            .await
            .unwrap();

        let report = queue
            .run_cycle(AgentRole::Analytics, |task| async move {
                if task.task_type == TaskType::Custom("crash".into()) {
                    panic!("GA4 client blew up");
                }
                anyhow::Ok(Payload::new(json!({ "sessions": 7 })))
            })
            .await
            .unwrap();
        assert_eq!(report, CycleReport { processed: 1, failed: 1 });

        let crashing = queue.get(&crashing.id).await.unwrap();
        assert_eq!(crashing.status, TaskStatus::Pending);
        assert_eq!(crashing.attempts, 1);
        assert!(crashing.last_error.unwrap().starts_with("panicked: "));
        assert!(crashing.not_before.is_some());

        let fine = queue.get(&fine.id).await.unwrap();
        assert_eq!(fine.status, TaskStatus::Complete);
    }

    #[tokio::test]
    async fn test_mark_failed_without_retry() {
        let (queue, _) = queue_with(RetryPolicy::no_retry());
        let task = queue
            .create_task(NewTask::new(AgentRole::Creative, TaskType::CreateAdCreatives, Payload::empty()))
            .await
            .unwrap();
        let failed = queue.mark_failed(&task.id, "quota exceeded").await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(queue.fetch_pending(AgentRole::Creative).await.unwrap().is_empty());
    }
}
