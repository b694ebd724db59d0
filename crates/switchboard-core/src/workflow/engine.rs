//! Workflow engine: the persisted state machine that walks an instance
//! through its definition, one dispatched task per step.
//!
//! ```text
//! running ──pause──► paused ──resume──► running
//!    │
//!    └── current_step == total_steps on advance ──► completed
//! ```
//!
//! `current_step` counts dispatched steps. `advance` creates the task for
//! step `current_step` and bumps the cursor in the same transaction; the
//! *next* step is only dispatched when something external (an approval, or
//! a task completion for `task_complete` steps) calls `advance` again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};

use super::definition::{Continuation, WorkflowRegistry};
use crate::error::CoreError;
use crate::events::{AgentEvent, EventBus};
use crate::models::payload::Payload;
use crate::models::task::{NewTask, WORKFLOW_DATA_KEY, WORKFLOW_ID_KEY, WORKFLOW_STEP_KEY};
use crate::models::workflow::{StepResult, WorkflowInstance, WorkflowStatus};
use crate::queue::{build_task, TaskQueue};
use crate::store::WorkflowStore;

/// What a call to [`WorkflowEngine::advance`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Instance is paused/completed/failed; nothing changed.
    NotRunning { status: WorkflowStatus },
    /// All steps were dispatched; the instance is now completed.
    Completed,
    /// The task for `step` was created.
    Dispatched { step: usize, task_id: String },
    /// Another advance moved the cursor first; nothing changed.
    Superseded,
}

#[derive(Clone)]
pub struct WorkflowEngine {
    registry: Arc<WorkflowRegistry>,
    store: WorkflowStore,
    queue: TaskQueue,
    event_bus: EventBus,
}

impl WorkflowEngine {
    pub fn new(
        registry: Arc<WorkflowRegistry>,
        store: WorkflowStore,
        queue: TaskQueue,
        event_bus: EventBus,
    ) -> Self {
        Self {
            registry,
            store,
            queue,
            event_bus,
        }
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Create a running instance and dispatch its first step. A workflow
    /// with no steps completes before this returns.
    pub async fn start(&self, workflow_type: &str, payload: Value) -> Result<WorkflowInstance, CoreError> {
        let def = self.registry.get(workflow_type)?;
        let instance = WorkflowInstance::new(workflow_type, def.steps.len(), Payload::new(payload));
        self.store.insert(&instance).await?;
        tracing::info!(
            workflow_id = %instance.id,
            "[WorkflowEngine] Started {} ({} steps)",
            workflow_type,
            instance.total_steps
        );

        self.advance(&instance.id).await?;
        self.require(&instance.id).await
    }

    /// Dispatch the next step, or complete the instance when every step has
    /// been dispatched. A no-op unless the instance is running.
    pub async fn advance(&self, workflow_id: &str) -> Result<AdvanceOutcome, CoreError> {
        self.advance_from(workflow_id, None).await
    }

    /// Advance only if `step` is the most recently dispatched step, so a
    /// stale or repeated signal for an older step changes nothing.
    pub async fn advance_after(&self, workflow_id: &str, step: usize) -> Result<AdvanceOutcome, CoreError> {
        self.advance_from(workflow_id, Some(step + 1)).await
    }

    /// Every write below is a compare-and-set on the `current_step` read
    /// here, so concurrent callers cannot both move the cursor.
    async fn advance_from(
        &self,
        workflow_id: &str,
        expected_step: Option<usize>,
    ) -> Result<AdvanceOutcome, CoreError> {
        let instance = self.require(workflow_id).await?;
        if instance.status != WorkflowStatus::Running {
            tracing::debug!(
                workflow_id,
                "[WorkflowEngine] advance ignored, status is {}",
                instance.status.as_str()
            );
            return Ok(AdvanceOutcome::NotRunning {
                status: instance.status,
            });
        }

        let step_index = instance.current_step;
        if expected_step.is_some_and(|expected| expected != step_index) {
            tracing::debug!(
                workflow_id,
                current_step = step_index,
                "[WorkflowEngine] Stale continuation ignored"
            );
            return Ok(AdvanceOutcome::Superseded);
        }
        if step_index >= instance.total_steps {
            if !self.store.complete(workflow_id, step_index).await? {
                return Ok(AdvanceOutcome::Superseded);
            }
            tracing::info!(workflow_id, "[WorkflowEngine] Completed {}", instance.workflow_type);
            self.event_bus
                .publish(AgentEvent::WorkflowCompleted {
                    workflow_id: workflow_id.to_string(),
                    workflow_type: instance.workflow_type.clone(),
                })
                .await;
            return Ok(AdvanceOutcome::Completed);
        }

        let def = self.registry.get(&instance.workflow_type)?;
        let step = def.steps.get(step_index).ok_or_else(|| {
            CoreError::Config(format!(
                "Workflow '{}' has {} steps but instance {} expects {}",
                def.name,
                def.steps.len(),
                workflow_id,
                instance.total_steps
            ))
        })?;

        let mut coordinates = Map::new();
        coordinates.insert(WORKFLOW_ID_KEY.to_string(), json!(workflow_id));
        coordinates.insert(WORKFLOW_STEP_KEY.to_string(), json!(step_index));
        coordinates.insert(WORKFLOW_DATA_KEY.to_string(), instance.payload.data.clone());
        let payload = Payload::new(Value::Object(step.payload.clone())).merged(coordinates);

        let task = build_task(
            NewTask::new(step.agent, step.task_type.clone(), payload).with_priority(step.priority),
        )?;
        if !self.store.dispatch_step(workflow_id, step_index, &task).await? {
            tracing::debug!(workflow_id, step = step_index, "[WorkflowEngine] Step already dispatched");
            return Ok(AdvanceOutcome::Superseded);
        }

        tracing::info!(
            workflow_id,
            task_id = %task.id,
            "[WorkflowEngine] Dispatched step {}/{} '{}' to {}",
            step_index + 1,
            instance.total_steps,
            step.label(),
            step.agent
        );
        self.queue.announce_created(&task).await;
        Ok(AdvanceOutcome::Dispatched {
            step: step_index,
            task_id: task.id,
        })
    }

    pub async fn pause(&self, workflow_id: &str) -> Result<WorkflowInstance, CoreError> {
        if !self
            .store
            .set_status(workflow_id, WorkflowStatus::Running, WorkflowStatus::Paused)
            .await?
        {
            let instance = self.require(workflow_id).await?;
            return Err(CoreError::Conflict(format!(
                "Workflow {} is {}, not running",
                workflow_id,
                instance.status.as_str()
            )));
        }
        tracing::info!(workflow_id, "[WorkflowEngine] Paused");
        self.require(workflow_id).await
    }

    /// Resume a paused instance and advance it once immediately.
    pub async fn resume(&self, workflow_id: &str) -> Result<(WorkflowInstance, AdvanceOutcome), CoreError> {
        if !self
            .store
            .set_status(workflow_id, WorkflowStatus::Paused, WorkflowStatus::Running)
            .await?
        {
            let instance = self.require(workflow_id).await?;
            return Err(CoreError::Conflict(format!(
                "Workflow {} is {}, not paused",
                workflow_id,
                instance.status.as_str()
            )));
        }
        tracing::info!(workflow_id, "[WorkflowEngine] Resumed");
        let outcome = self.advance(workflow_id).await?;
        Ok((self.require(workflow_id).await?, outcome))
    }

    pub async fn get_status(&self, workflow_id: &str) -> Result<Option<WorkflowInstance>, CoreError> {
        self.store.get(workflow_id).await
    }

    pub async fn list(&self, status: Option<WorkflowStatus>) -> Result<Vec<WorkflowInstance>, CoreError> {
        self.store.list(status).await
    }

    /// Running instances untouched for longer than `threshold`. Report only.
    pub async fn find_stalled(&self, threshold: chrono::Duration) -> Result<Vec<WorkflowInstance>, CoreError> {
        let cutoff = Utc::now().checked_sub_signed(threshold).unwrap_or(DateTime::<Utc>::MIN_UTC);
        self.store.find_stalled(cutoff).await
    }

    /// Record a finished step task's result on its instance, and advance
    /// when the step continues on task completion.
    pub async fn on_step_completed(
        &self,
        workflow_id: &str,
        step: usize,
        task_id: &str,
        result: Payload,
    ) -> Result<Option<AdvanceOutcome>, CoreError> {
        let instance = self.require(workflow_id).await?;
        self.store
            .append_step_result(
                workflow_id,
                StepResult {
                    step,
                    task_id: task_id.to_string(),
                    result,
                    recorded_at: Utc::now(),
                },
            )
            .await?;

        let def = self.registry.get(&instance.workflow_type)?;
        match def.steps.get(step).map(|s| s.continue_on) {
            Some(Continuation::TaskComplete) => Ok(Some(self.advance_after(workflow_id, step).await?)),
            _ => Ok(None),
        }
    }

    async fn require(&self, workflow_id: &str) -> Result<WorkflowInstance, CoreError> {
        self.store
            .get(workflow_id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Workflow {} not found", workflow_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::db::Database;
    use crate::models::task::{AgentRole, TaskStatus, TaskType};
    use crate::store::TaskStore;
    use crate::workflow::builtin::NEW_BLOG_POST;
    use crate::workflow::definition::WorkflowStep;

    struct Fixture {
        engine: WorkflowEngine,
        tasks: TaskStore,
    }

    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let bus = EventBus::new();
        let tasks = TaskStore::new(db.clone());
        let queue = TaskQueue::new(tasks.clone(), bus.clone(), RetryPolicy::default());
        let registry = Arc::new(WorkflowRegistry::with_builtins().unwrap());
        registry.register_steps("empty", Vec::new()).unwrap();
        registry
            .register_steps(
                "auto",
                vec![
                    WorkflowStep::new(AgentRole::Research, TaskType::MarketResearch)
                        .continue_on(Continuation::TaskComplete),
                    WorkflowStep::new(AgentRole::Content, TaskType::WriteBlogPost),
                ],
            )
            .unwrap();
        Fixture {
            engine: WorkflowEngine::new(registry, WorkflowStore::new(db), queue, bus),
            tasks,
        }
    }

    #[tokio::test]
    async fn test_start_new_blog_post_dispatches_brief() {
        let f = fixture();
        let instance = f
            .engine
            .start(NEW_BLOG_POST, json!({ "topic": "CRM for agencies" }))
            .await
            .unwrap();
        assert_eq!(instance.status, WorkflowStatus::Running);
        assert_eq!(instance.current_step, 1);
        assert_eq!(instance.total_steps, 4);

        let tasks = f.tasks.list_by_workflow(&instance.id).await.unwrap();
        assert_eq!(tasks.len(), 1);
        let brief = &tasks[0];
        assert_eq!(brief.assigned_agent, AgentRole::Seo);
        assert_eq!(brief.task_type, TaskType::CreateContentBrief);
        assert_eq!(brief.status, TaskStatus::Pending);
        assert_eq!(brief.workflow_id(), Some(instance.id.as_str()));
        assert_eq!(brief.workflow_step(), Some(0));
        assert_eq!(brief.payload.get("include_keywords"), Some(&json!(true)));
        assert_eq!(
            brief.payload.get("workflow_data"),
            Some(&json!({ "topic": "CRM for agencies" }))
        );
    }

    #[tokio::test]
    async fn test_zero_step_workflow_completes_on_start() {
        let f = fixture();
        let instance = f.engine.start("empty", json!({})).await.unwrap();
        assert_eq!(instance.status, WorkflowStatus::Completed);
        assert_eq!(instance.current_step, 0);
        assert!(instance.completed_at.is_some());
        assert!(f.tasks.list_by_workflow(&instance.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_type_is_config_error() {
        let f = fixture();
        let err = f.engine.start("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
        assert!(f.engine.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_advance_walks_to_completion() {
        let f = fixture();
        let instance = f.engine.start(NEW_BLOG_POST, json!({})).await.unwrap();
        for expected_step in 1..4 {
            let outcome = f.engine.advance(&instance.id).await.unwrap();
            assert!(matches!(outcome, AdvanceOutcome::Dispatched { step, .. } if step == expected_step));
        }
        let current = f.engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(current.current_step, 4);
        assert_eq!(current.status, WorkflowStatus::Running);

        assert_eq!(f.engine.advance(&instance.id).await.unwrap(), AdvanceOutcome::Completed);
        let done = f.engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(done.status, WorkflowStatus::Completed);
        assert_eq!(done.current_step, done.total_steps);
        assert_eq!(f.tasks.list_by_workflow(&instance.id).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_advance_is_noop_when_not_running() {
        let f = fixture();
        let instance = f.engine.start(NEW_BLOG_POST, json!({})).await.unwrap();
        f.engine.pause(&instance.id).await.unwrap();

        for _ in 0..3 {
            let outcome = f.engine.advance(&instance.id).await.unwrap();
            assert_eq!(
                outcome,
                AdvanceOutcome::NotRunning {
                    status: WorkflowStatus::Paused
                }
            );
        }
        let paused = f.engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(paused.current_step, 1);
        assert_eq!(paused.updated_at, f.engine.get_status(&instance.id).await.unwrap().unwrap().updated_at);
        assert_eq!(f.tasks.list_by_workflow(&instance.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pause_resume_transitions() {
        let f = fixture();
        let instance = f.engine.start(NEW_BLOG_POST, json!({})).await.unwrap();

        assert!(matches!(f.engine.resume(&instance.id).await, Err(CoreError::Conflict(_))));
        f.engine.pause(&instance.id).await.unwrap();
        assert!(matches!(f.engine.pause(&instance.id).await, Err(CoreError::Conflict(_))));
        assert!(matches!(f.engine.pause("missing").await, Err(CoreError::NotFound(_))));

        // Resume advances once straight away.
        let (resumed, outcome) = f.engine.resume(&instance.id).await.unwrap();
        assert_eq!(resumed.status, WorkflowStatus::Running);
        assert_eq!(resumed.current_step, 2);
        assert!(matches!(outcome, AdvanceOutcome::Dispatched { step: 1, .. }));
    }

    #[tokio::test]
    async fn test_concurrent_advances_dispatch_once() {
        let f = fixture();
        let instance = f.engine.start(NEW_BLOG_POST, json!({})).await.unwrap();

        let (a, b) = tokio::join!(f.engine.advance(&instance.id), f.engine.advance(&instance.id));
        a.unwrap();
        b.unwrap();

        // Whatever the interleaving, no step has two tasks and the cursor
        // matches the number of dispatched tasks.
        let current = f.engine.get_status(&instance.id).await.unwrap().unwrap();
        let mut steps: Vec<usize> = f
            .tasks
            .list_by_workflow(&instance.id)
            .await
            .unwrap()
            .iter()
            .filter_map(|t| t.workflow_step())
            .collect();
        steps.sort_unstable();
        assert_eq!(steps, (0..current.current_step).collect::<Vec<_>>());
        assert!(current.current_step >= 2);
    }

    #[tokio::test]
    async fn test_duplicate_continuations_advance_once() {
        let f = fixture();
        let instance = f.engine.start(NEW_BLOG_POST, json!({})).await.unwrap();

        let (a, b) = tokio::join!(
            f.engine.advance_after(&instance.id, 0),
            f.engine.advance_after(&instance.id, 0)
        );
        let dispatched = [a.unwrap(), b.unwrap()]
            .iter()
            .filter(|o| matches!(o, AdvanceOutcome::Dispatched { .. }))
            .count();
        assert_eq!(dispatched, 1);

        let current = f.engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(current.current_step, 2);
        assert_eq!(f.tasks.list_by_workflow(&instance.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_advance_after_ignores_stale_step() {
        let f = fixture();
        let instance = f.engine.start(NEW_BLOG_POST, json!({})).await.unwrap();

        assert!(matches!(
            f.engine.advance_after(&instance.id, 0).await.unwrap(),
            AdvanceOutcome::Dispatched { step: 1, .. }
        ));
        // Same signal again: step 0 is no longer the latest dispatched step.
        assert_eq!(
            f.engine.advance_after(&instance.id, 0).await.unwrap(),
            AdvanceOutcome::Superseded
        );
        let current = f.engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(current.current_step, 2);
    }

    #[tokio::test]
    async fn test_task_complete_step_advances_on_completion() {
        let f = fixture();
        let instance = f.engine.start("auto", json!({ "market": "EU" })).await.unwrap();
        let research = &f.tasks.list_by_workflow(&instance.id).await.unwrap()[0];

        let outcome = f
            .engine
            .on_step_completed(&instance.id, 0, &research.id, Payload::new(json!({ "segments": 4 })))
            .await
            .unwrap();
        assert!(matches!(outcome, Some(AdvanceOutcome::Dispatched { step: 1, .. })));

        let current = f.engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(current.current_step, 2);
        assert_eq!(current.step_results.len(), 1);
        assert_eq!(current.step_results[0].result.get("segments"), Some(&json!(4)));

        // Step 1 waits for an approval, so its completion only records the result.
        let draft = &f.tasks.list_by_workflow(&instance.id).await.unwrap()[1];
        let outcome = f
            .engine
            .on_step_completed(&instance.id, 1, &draft.id, Payload::empty())
            .await
            .unwrap();
        assert!(outcome.is_none());
        let current = f.engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(current.status, WorkflowStatus::Running);
        assert_eq!(current.step_results.len(), 2);
    }

    #[tokio::test]
    async fn test_find_stalled_uses_threshold() {
        let f = fixture();
        let instance = f.engine.start(NEW_BLOG_POST, json!({})).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let stalled = f.engine.find_stalled(chrono::Duration::zero()).await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].id, instance.id);
        assert!(f.engine.find_stalled(chrono::Duration::hours(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_stalled_with_threshold_past_min_date() {
        let f = fixture();
        f.engine.start(NEW_BLOG_POST, json!({})).await.unwrap();
        let stalled = f.engine.find_stalled(chrono::Duration::MAX).await.unwrap();
        assert!(stalled.is_empty());
    }
}
