//! Shared engine state: one store handle, one event bus, and the services
//! wired on top of them.

use std::sync::Arc;

use crate::config::EngineConfig;
use crate::db::Database;
use crate::error::CoreError;
use crate::events::EventBus;
use crate::gate::ApprovalGate;
use crate::orchestration::Orchestrator;
use crate::queue::TaskQueue;
use crate::scheduler::Scheduler;
use crate::store::{ApprovalStore, JobStore, TaskStore, WorkflowStore};
use crate::workflow::{WorkflowEngine, WorkflowRegistry};

pub struct AppStateInner {
    pub db: Database,
    pub config: EngineConfig,
    pub event_bus: EventBus,
    pub task_queue: TaskQueue,
    pub approval_gate: ApprovalGate,
    pub workflow_engine: WorkflowEngine,
    pub scheduler: Scheduler,
    pub orchestrator: Orchestrator,
}

pub type AppState = Arc<AppStateInner>;

impl AppStateInner {
    /// Wire every service against `db`. Built-in workflows are always
    /// registered; `config.workflows_dir` adds (or replaces) definitions.
    pub fn new(db: Database, config: EngineConfig) -> Result<Self, CoreError> {
        let registry = WorkflowRegistry::with_builtins()?;
        if let Some(dir) = &config.workflows_dir {
            let loaded = registry.load_dir(dir)?;
            tracing::info!("[AppState] Loaded {} workflow definition(s) from {}", loaded, dir);
        }

        let event_bus = EventBus::new();
        let task_queue = TaskQueue::new(TaskStore::new(db.clone()), event_bus.clone(), config.retry);
        let approval_gate = ApprovalGate::new(
            ApprovalStore::new(db.clone()),
            TaskStore::new(db.clone()),
            event_bus.clone(),
        );
        let workflow_engine = WorkflowEngine::new(
            Arc::new(registry),
            WorkflowStore::new(db.clone()),
            task_queue.clone(),
            event_bus.clone(),
        );
        let orchestrator = Orchestrator::new(
            task_queue.clone(),
            approval_gate.clone(),
            workflow_engine.clone(),
            event_bus.clone(),
            config.clone(),
        );

        Ok(Self {
            scheduler: Scheduler::new(JobStore::new(db.clone())),
            db,
            config,
            event_bus,
            task_queue,
            approval_gate,
            workflow_engine,
            orchestrator,
        })
    }
}

/// Build the state and attach the orchestrator's event handlers.
pub async fn bootstrap(db: Database, config: EngineConfig) -> Result<AppState, CoreError> {
    let state = AppStateInner::new(db, config)?;
    state.orchestrator.attach().await;
    Ok(Arc::new(state))
}
