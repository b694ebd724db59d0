use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::Payload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Paused,
    Completed,
    /// Reserved for operator use; the engine never sets it on its own.
    Failed,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Result recorded when a workflow step's task completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: usize,
    pub task_id: String,
    pub result: Payload,
    pub recorded_at: DateTime<Utc>,
}

/// Persisted cursor over a workflow definition.
///
/// `current_step` counts dispatched steps: after step N's task has been
/// created, `current_step == N + 1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstance {
    pub id: String,
    pub workflow_type: String,
    pub status: WorkflowStatus,
    pub current_step: usize,
    pub total_steps: usize,
    pub payload: Payload,
    pub step_results: Vec<StepResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    pub fn new(workflow_type: &str, total_steps: usize, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_type: workflow_type.to_string(),
            status: WorkflowStatus::Running,
            current_step: 0,
            total_steps,
            payload,
            step_results: Vec::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}
