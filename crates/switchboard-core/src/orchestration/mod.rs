//! Orchestrator - routes its own queue and reacts to cross-agent events.
//!
//! The orchestrator is an agent like any other: it pulls `orchestrator`
//! tasks on every scheduled cycle and dispatches them by type:
//!   - `start_workflow`   → WorkflowEngine::start
//!   - `advance_workflow` → WorkflowEngine::advance
//!   - `distribute_task`  → TaskQueue::create_task for another agent
//!   - `sweep_approvals`  → approval reminder sweep
//!
//! It also subscribes to `approval.completed` (advance the linked workflow
//! when approved), `task.completed` (record step results, continue
//! `task_complete` steps) and `lead.score_threshold` (logged only).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::events::{
    AgentEvent, EventBus, APPROVAL_COMPLETED, APPROVAL_REMINDER_DUE, SCORE_THRESHOLD, TASK_COMPLETED,
};
use crate::gate::ApprovalGate;
use crate::models::approval::{ApprovalItem, ApprovalStatus};
use crate::models::payload::Payload;
use crate::models::task::{AgentRole, AgentTask, NewTask, TaskType};
use crate::queue::{CycleReport, TaskQueue};
use crate::scheduler::{JobSpec, Scheduler};
use crate::workflow::WorkflowEngine;

pub const JOB_OWNER: &str = "orchestrator";
pub const JOB_RUN_CYCLE: &str = "orchestrator.run_cycle";
pub const JOB_STALLED_SWEEP: &str = "orchestrator.stalled_sweep";
pub const JOB_APPROVAL_SWEEP: &str = "orchestrator.approval_sweep";

// ─── Task payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartWorkflowPayload {
    pub workflow_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvanceWorkflowPayload {
    pub workflow_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributeTaskPayload {
    pub target_agent: String,
    pub task_type: String,
    #[serde(default)]
    pub payload: Value,
    /// Defaults to the distributing task's own priority.
    #[serde(default)]
    pub priority: Option<u8>,
}

/// One entry of the stalled-workflow report.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StalledWorkflow {
    pub workflow_id: String,
    pub workflow_type: String,
    pub current_step: usize,
    pub total_steps: usize,
    pub updated_at: DateTime<Utc>,
    pub idle_secs: i64,
}

// ─── Orchestrator ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Orchestrator {
    queue: TaskQueue,
    gate: ApprovalGate,
    engine: WorkflowEngine,
    event_bus: EventBus,
    config: EngineConfig,
}

impl Orchestrator {
    pub fn new(
        queue: TaskQueue,
        gate: ApprovalGate,
        engine: WorkflowEngine,
        event_bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue,
            gate,
            engine,
            event_bus,
            config,
        }
    }

    /// Subscribe the orchestrator's event handlers. Call once per process.
    pub async fn attach(&self) {
        let engine = self.engine.clone();
        self.event_bus
            .subscribe(APPROVAL_COMPLETED, move |event| {
                let engine = engine.clone();
                async move {
                    let AgentEvent::ApprovalCompleted {
                        approval_id,
                        status,
                        workflow_id,
                        workflow_step,
                        ..
                    } = event
                    else {
                        return Ok(());
                    };
                    let Some(workflow_id) = workflow_id else {
                        return Ok(());
                    };
                    if status != ApprovalStatus::Approved {
                        tracing::info!(
                            workflow_id = %workflow_id,
                            "[Orchestrator] Approval {} was {}, workflow stays put",
                            approval_id,
                            status.as_str()
                        );
                        return Ok(());
                    }
                    let outcome = match workflow_step {
                        Some(step) => engine.advance_after(&workflow_id, step).await?,
                        None => engine.advance(&workflow_id).await?,
                    };
                    tracing::info!(
                        workflow_id = %workflow_id,
                        "[Orchestrator] Approval {} advanced workflow: {:?}",
                        approval_id,
                        outcome
                    );
                    anyhow::Ok(())
                }
            })
            .await;

        let engine = self.engine.clone();
        let queue = self.queue.clone();
        self.event_bus
            .subscribe(TASK_COMPLETED, move |event| {
                let (engine, queue) = (engine.clone(), queue.clone());
                async move {
                    let AgentEvent::TaskCompleted {
                        task_id,
                        workflow_id: Some(workflow_id),
                        workflow_step: Some(step),
                        ..
                    } = event
                    else {
                        return Ok(());
                    };
                    let task = queue.get(&task_id).await?;
                    let result = task.result.unwrap_or_default();
                    if let Some(outcome) = engine
                        .on_step_completed(&workflow_id, step, &task_id, result)
                        .await?
                    {
                        tracing::info!(
                            workflow_id = %workflow_id,
                            "[Orchestrator] Step {} completed, workflow continued: {:?}",
                            step,
                            outcome
                        );
                    }
                    anyhow::Ok(())
                }
            })
            .await;

        self.event_bus
            .subscribe(SCORE_THRESHOLD, |event| async move {
                if let AgentEvent::ScoreThreshold {
                    lead_id,
                    score,
                    threshold,
                } = event
                {
                    tracing::info!(
                        "[Orchestrator] Lead {} crossed score threshold ({} >= {})",
                        lead_id,
                        score,
                        threshold
                    );
                }
                anyhow::Ok(())
            })
            .await;

        tracing::debug!("[Orchestrator] Event handlers attached");
    }

    /// Process every pending orchestrator task once.
    pub async fn run_cycle(&self) -> Result<CycleReport, CoreError> {
        let this = self.clone();
        self.queue
            .run_cycle(AgentRole::Orchestrator, move |task| {
                let this = this.clone();
                async move { this.dispatch(task).await }
            })
            .await
    }

    /// Execute one orchestrator task and return its result payload.
    pub async fn dispatch(&self, task: AgentTask) -> anyhow::Result<Payload> {
        match &task.task_type {
            TaskType::StartWorkflow => {
                let input: StartWorkflowPayload = task.payload.decode()?;
                let instance = self.engine.start(&input.workflow_type, input.payload).await?;
                Ok(Payload::new(json!({
                    "workflow_id": instance.id,
                    "status": instance.status,
                    "current_step": instance.current_step,
                })))
            }
            TaskType::AdvanceWorkflow => {
                let input: AdvanceWorkflowPayload = task.payload.decode()?;
                let outcome = self.engine.advance(&input.workflow_id).await?;
                Ok(Payload::encode(&outcome)?)
            }
            TaskType::DistributeTask => {
                let input: DistributeTaskPayload = task.payload.decode()?;
                let target = AgentRole::from_str(&input.target_agent).ok_or_else(|| {
                    CoreError::Config(format!("Unknown target agent '{}'", input.target_agent))
                })?;
                let payload = match input.payload {
                    Value::Null => Payload::empty(),
                    data => Payload::new(data),
                };
                let created = self
                    .queue
                    .create_task(
                        NewTask::new(target, TaskType::parse(&input.task_type), payload)
                            .with_priority(input.priority.unwrap_or(task.priority))
                            .created_by(AgentRole::Orchestrator.as_str()),
                    )
                    .await?;
                Ok(Payload::new(json!({
                    "task_id": created.id,
                    "assigned_agent": created.assigned_agent,
                })))
            }
            TaskType::SweepApprovals => {
                let reminded = self.sweep_approvals().await?;
                let ids: Vec<&str> = reminded.iter().map(|a| a.id.as_str()).collect();
                Ok(Payload::new(json!({ "reminded": ids })))
            }
            other => Err(CoreError::Config(format!(
                "Orchestrator cannot handle task type '{}'",
                other
            ))
            .into()),
        }
    }

    /// Report running workflows idle for longer than the stalled threshold.
    /// Nothing is changed.
    pub async fn detect_stalled_workflows(&self) -> Result<Vec<StalledWorkflow>, CoreError> {
        let now = Utc::now();
        let stalled: Vec<StalledWorkflow> = self
            .engine
            .find_stalled(self.config.stalled_threshold())
            .await?
            .into_iter()
            .map(|w| StalledWorkflow {
                idle_secs: (now - w.updated_at).num_seconds(),
                workflow_id: w.id,
                workflow_type: w.workflow_type,
                current_step: w.current_step,
                total_steps: w.total_steps,
                updated_at: w.updated_at,
            })
            .collect();

        for w in &stalled {
            tracing::warn!(
                workflow_id = %w.workflow_id,
                "[Orchestrator] Stalled {} at step {}/{}, idle {}s",
                w.workflow_type,
                w.current_step,
                w.total_steps,
                w.idle_secs
            );
        }
        Ok(stalled)
    }

    /// Find approvals waiting past the reminder threshold, announce each as
    /// an `approval.reminder_due` event and record the reminder.
    pub async fn sweep_approvals(&self) -> Result<Vec<ApprovalItem>, CoreError> {
        let candidates = self
            .gate
            .sweep_needs_reminder(self.config.approval_reminder_after())
            .await?;

        let mut reminded = Vec::with_capacity(candidates.len());
        for item in candidates {
            self.event_bus
                .publish(AgentEvent::Custom {
                    name: APPROVAL_REMINDER_DUE.to_string(),
                    data: json!({
                        "approval_id": item.id,
                        "type": item.approval_type,
                        "title": item.title,
                        "created_at": item.created_at,
                    }),
                })
                .await;
            reminded.push(self.gate.record_reminder(&item.id).await?);
        }
        Ok(reminded)
    }

    /// Register the orchestrator cycle and both maintenance sweeps.
    pub async fn register_jobs(&self, scheduler: &Scheduler) -> Result<(), CoreError> {
        let jobs = &self.config.jobs;

        let this = self.clone();
        scheduler
            .register_job(
                JOB_OWNER,
                JobSpec::new(JOB_RUN_CYCLE, &jobs.orchestrator_cycle, move || {
                    let this = this.clone();
                    async move {
                        this.run_cycle().await?;
                        anyhow::Ok(())
                    }
                }),
            )
            .await?;

        let this = self.clone();
        scheduler
            .register_job(
                JOB_OWNER,
                JobSpec::new(JOB_STALLED_SWEEP, &jobs.stalled_sweep, move || {
                    let this = this.clone();
                    async move {
                        this.detect_stalled_workflows().await?;
                        anyhow::Ok(())
                    }
                }),
            )
            .await?;

        let this = self.clone();
        scheduler
            .register_job(
                JOB_OWNER,
                JobSpec::new(JOB_APPROVAL_SWEEP, &jobs.approval_sweep, move || {
                    let this = this.clone();
                    async move {
                        this.sweep_approvals().await?;
                        anyhow::Ok(())
                    }
                }),
            )
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::models::approval::NewApproval;
    use crate::models::task::TaskStatus;
    use crate::models::workflow::WorkflowStatus;
    use crate::state::{bootstrap, AppState};
    use crate::store::JobStore;
    use crate::workflow::builtin::{NEW_BLOG_POST, WEEKLY_REPORT};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn setup(config: EngineConfig) -> AppState {
        let db = Database::open_in_memory().unwrap();
        bootstrap(db, config).await.unwrap()
    }

    async fn enqueue(state: &AppState, task_type: TaskType, payload: Value) -> AgentTask {
        state
            .task_queue
            .create_task(NewTask::new(AgentRole::Orchestrator, task_type, Payload::new(payload)))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_cycle_starts_workflow() {
        let state = setup(EngineConfig::default()).await;
        let task = enqueue(
            &state,
            TaskType::StartWorkflow,
            json!({ "workflow_type": NEW_BLOG_POST, "payload": { "topic": "pipeline hygiene" } }),
        )
        .await;

        let report = state.orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 0);

        let done = state.task_queue.get(&task.id).await.unwrap();
        assert_eq!(done.status, TaskStatus::Complete);
        let result = done.result.unwrap();
        let workflow_id = result.get_str("workflow_id").unwrap().to_string();
        assert_eq!(result.get("current_step"), Some(&json!(1)));

        let seo = state.task_queue.fetch_pending(AgentRole::Seo).await.unwrap();
        assert_eq!(seo.len(), 1);
        assert_eq!(seo[0].workflow_id(), Some(workflow_id.as_str()));
    }

    #[tokio::test]
    async fn test_unknown_workflow_type_fails_without_retry() {
        let state = setup(EngineConfig::default()).await;
        let task = enqueue(&state, TaskType::StartWorkflow, json!({ "workflow_type": "no_such_flow" })).await;

        let report = state.orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.failed, 1);

        let failed = state.task_queue.get(&task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.last_error.unwrap().contains("no_such_flow"));
    }

    #[tokio::test]
    async fn test_distribute_task_inherits_priority() {
        let state = setup(EngineConfig::default()).await;
        let parent = state
            .task_queue
            .create_task(
                NewTask::new(
                    AgentRole::Orchestrator,
                    TaskType::DistributeTask,
                    Payload::new(json!({ "target_agent": "paid_media", "task_type": "pause_ad_set" })),
                )
                .with_priority(2),
            )
            .await
            .unwrap();

        state.orchestrator.run_cycle().await.unwrap();

        let result = state.task_queue.get(&parent.id).await.unwrap().result.unwrap();
        let child_id = result.get_str("task_id").unwrap();
        let child = state.task_queue.get(child_id).await.unwrap();
        assert_eq!(child.assigned_agent, AgentRole::PaidMedia);
        assert_eq!(child.task_type, TaskType::Custom("pause_ad_set".into()));
        assert_eq!(child.priority, 2);
        assert_eq!(child.created_by, "orchestrator");
    }

    #[tokio::test]
    async fn test_distribute_to_unknown_agent_fails() {
        let state = setup(EngineConfig::default()).await;
        let task = enqueue(
            &state,
            TaskType::DistributeTask,
            json!({ "target_agent": "billing", "task_type": "refund" }),
        )
        .await;

        state.orchestrator.run_cycle().await.unwrap();
        let failed = state.task_queue.get(&task.id).await.unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_unhandled_task_type_fails() {
        let state = setup(EngineConfig::default()).await;
        let task = enqueue(&state, TaskType::WriteBlogPost, json!({})).await;
        state.orchestrator.run_cycle().await.unwrap();
        assert_eq!(state.task_queue.get(&task.id).await.unwrap().status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_approved_approval_advances_workflow() {
        let state = setup(EngineConfig::default()).await;
        let instance = state.workflow_engine.start(NEW_BLOG_POST, json!({})).await.unwrap();
        let brief = state.task_queue.fetch_pending(AgentRole::Seo).await.unwrap().remove(0);

        let approval = state
            .approval_gate
            .create_approval(NewApproval::new("content_brief", "Brief: pipeline hygiene", "seo").related_task(&brief.id))
            .await
            .unwrap();
        state
            .approval_gate
            .resolve(&approval.id, ApprovalStatus::Approved, "marketing-lead", None)
            .await
            .unwrap();

        let current = state.workflow_engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(current.current_step, 2);
        let drafts = state.task_queue.fetch_pending(AgentRole::Content).await.unwrap();
        assert_eq!(drafts.len(), 1);
        assert_eq!(drafts[0].task_type, TaskType::WriteBlogPost);
        assert_eq!(drafts[0].workflow_step(), Some(1));
    }

    #[tokio::test]
    async fn test_rejected_approval_leaves_workflow() {
        let state = setup(EngineConfig::default()).await;
        let instance = state.workflow_engine.start(NEW_BLOG_POST, json!({})).await.unwrap();
        let brief = state.task_queue.fetch_pending(AgentRole::Seo).await.unwrap().remove(0);

        for status in [ApprovalStatus::Rejected, ApprovalStatus::RevisionRequested] {
            let approval = state
                .approval_gate
                .create_approval(NewApproval::new("content_brief", "Brief", "seo").related_task(&brief.id))
                .await
                .unwrap();
            state
                .approval_gate
                .resolve(&approval.id, status, "marketing-lead", Some("tighten the angle".into()))
                .await
                .unwrap();
        }

        let current = state.workflow_engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(current.current_step, 1);
        assert!(state.task_queue.fetch_pending(AgentRole::Content).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_task_completion_records_result_and_continues() {
        let state = setup(EngineConfig::default()).await;
        let instance = state
            .workflow_engine
            .start(WEEKLY_REPORT, json!({ "week": 41 }))
            .await
            .unwrap();

        let metrics = state.task_queue.fetch_pending(AgentRole::Analytics).await.unwrap().remove(0);
        state.task_queue.mark_in_progress(&metrics.id).await.unwrap();
        state
            .task_queue
            .mark_complete(&metrics.id, Payload::new(json!({ "sessions": 1200 })))
            .await
            .unwrap();

        let current = state.workflow_engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(current.current_step, 2);
        assert_eq!(current.step_results.len(), 1);
        assert_eq!(current.step_results[0].result.get("sessions"), Some(&json!(1200)));

        // The summary step waits for approval: completing it only records the result.
        let summary = state.task_queue.fetch_pending(AgentRole::Content).await.unwrap().remove(0);
        state.task_queue.mark_complete(&summary.id, Payload::empty()).await.unwrap();
        let current = state.workflow_engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(current.status, WorkflowStatus::Running);
        assert_eq!(current.step_results.len(), 2);
    }

    #[tokio::test]
    async fn test_detect_stalled_workflows() {
        let config = EngineConfig {
            stalled_threshold_secs: 0,
            ..EngineConfig::default()
        };
        let state = setup(config).await;
        let running = state.workflow_engine.start(NEW_BLOG_POST, json!({})).await.unwrap();
        let paused = state.workflow_engine.start(NEW_BLOG_POST, json!({})).await.unwrap();
        state.workflow_engine.pause(&paused.id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let stalled = state.orchestrator.detect_stalled_workflows().await.unwrap();
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].workflow_id, running.id);
        assert_eq!(stalled[0].current_step, 1);
        assert_eq!(stalled[0].total_steps, 4);
        assert!(stalled[0].idle_secs >= 0);
    }

    #[tokio::test]
    async fn test_sweeps_survive_oversized_thresholds() {
        let state = setup(EngineConfig {
            stalled_threshold_secs: 10_000_000_000_000,
            approval_reminder_after_secs: u64::MAX,
            ..EngineConfig::default()
        })
        .await;
        state.workflow_engine.start(NEW_BLOG_POST, json!({})).await.unwrap();
        state
            .approval_gate
            .create_approval(NewApproval::new("ad_copy", "Q4 ad copy", "creative"))
            .await
            .unwrap();

        assert!(state.orchestrator.detect_stalled_workflows().await.unwrap().is_empty());
        assert!(state.orchestrator.sweep_approvals().await.unwrap().is_empty());
        // Still usable afterwards.
        assert_eq!(state.workflow_engine.list(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sweep_approvals_reminds_once() {
        let config = EngineConfig {
            approval_reminder_after_secs: 0,
            ..EngineConfig::default()
        };
        let state = setup(config).await;
        let reminders = Arc::new(AtomicUsize::new(0));
        let counter = reminders.clone();
        state
            .event_bus
            .subscribe(APPROVAL_REMINDER_DUE, move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            })
            .await;

        let item = state
            .approval_gate
            .create_approval(NewApproval::new("ad_copy", "Q4 ad copy", "creative"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let reminded = state.orchestrator.sweep_approvals().await.unwrap();
        assert_eq!(reminded.len(), 1);
        assert_eq!(reminded[0].id, item.id);
        assert!(reminded[0].reminder_sent_at.is_some());
        assert_eq!(reminded[0].status, ApprovalStatus::Pending);

        assert!(state.orchestrator.sweep_approvals().await.unwrap().is_empty());

        // Reminder events are fire-and-forget.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(reminders.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sweep_approvals_task() {
        let state = setup(EngineConfig {
            approval_reminder_after_secs: 0,
            ..EngineConfig::default()
        })
        .await;
        state
            .approval_gate
            .create_approval(NewApproval::new("landing_page", "Spring landing page", "content"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let task = enqueue(&state, TaskType::SweepApprovals, json!({})).await;

        state.orchestrator.run_cycle().await.unwrap();
        let result = state.task_queue.get(&task.id).await.unwrap().result.unwrap();
        assert_eq!(result.get("reminded").and_then(|v| v.as_array()).map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_advance_workflow_task() {
        let state = setup(EngineConfig::default()).await;
        let instance = state.workflow_engine.start(NEW_BLOG_POST, json!({})).await.unwrap();

        let task = enqueue(&state, TaskType::AdvanceWorkflow, json!({ "workflow_id": instance.id })).await;
        state.orchestrator.run_cycle().await.unwrap();

        let result = state.task_queue.get(&task.id).await.unwrap().result.unwrap();
        assert_eq!(result.get_str("outcome"), Some("dispatched"));
        assert_eq!(result.get("step"), Some(&json!(1)));
        let current = state.workflow_engine.get_status(&instance.id).await.unwrap().unwrap();
        assert_eq!(current.current_step, 2);
    }

    #[tokio::test]
    async fn test_register_jobs() {
        let state = setup(EngineConfig::default()).await;
        state.orchestrator.register_jobs(&state.scheduler).await.unwrap();

        let mut names = state.scheduler.job_names().await;
        names.sort();
        assert_eq!(names, vec![JOB_APPROVAL_SWEEP, JOB_RUN_CYCLE, JOB_STALLED_SWEEP]);

        let jobs = JobStore::new(state.db.clone()).list().await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.iter().all(|j| j.owner == JOB_OWNER && j.next_run_at.is_some()));

        // Registering twice is a conflict.
        let err = state.orchestrator.register_jobs(&state.scheduler).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }
}
