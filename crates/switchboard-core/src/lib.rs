//! Switchboard Core — the multi-agent task and workflow orchestration engine.
//!
//! Agents never call each other directly. Work is handed over through the
//! shared SQLite store (tasks, approvals, workflow instances) and through the
//! in-process [`EventBus`]; everything is clocked externally by the
//! [`Scheduler`].
//!
//! ```text
//! Scheduler ──► Orchestrator::run_cycle ──► WorkflowEngine ──► TaskQueue
//!                      ▲                                          │
//!                      └──── EventBus ◄──── ApprovalGate ◄── agents
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod gate;
pub mod models;
pub mod orchestration;
pub mod queue;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod workflow;

// Convenience re-exports
pub use config::EngineConfig;
pub use db::Database;
pub use error::CoreError;
pub use events::{AgentEvent, EventBus};
pub use gate::ApprovalGate;
pub use orchestration::Orchestrator;
pub use queue::TaskQueue;
pub use scheduler::Scheduler;
pub use state::{bootstrap, AppState, AppStateInner};
pub use workflow::WorkflowEngine;
