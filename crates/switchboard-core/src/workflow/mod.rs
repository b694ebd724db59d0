//! Workflow engine: multi-step, multi-agent pipelines.
//!
//! # Architecture
//!
//! ```text
//! builtin / workflows/*.yaml ──► WorkflowRegistry
//!                                      │
//! start / advance / resume ──► WorkflowEngine ──► WorkflowStore (instances)
//!                                      │
//!                                      └──► agent_tasks (one task per step)
//! ```

pub mod builtin;
pub mod definition;
pub mod engine;

pub use definition::{Continuation, WorkflowDefinition, WorkflowRegistry, WorkflowStep};
pub use engine::{AdvanceOutcome, WorkflowEngine};
