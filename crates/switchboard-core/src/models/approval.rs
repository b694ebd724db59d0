use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::Payload;
use super::task::DEFAULT_PRIORITY;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    RevisionRequested,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::RevisionRequested => "revision_requested",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "revision_requested" => Some(Self::RevisionRequested),
            _ => None,
        }
    }

    /// Statuses a reviewer may resolve a pending item into.
    pub fn is_decision(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// A human-in-the-loop checkpoint. Closed, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalItem {
    pub id: String,
    #[serde(rename = "type")]
    pub approval_type: String,
    pub status: ApprovalStatus,
    pub priority: u8,
    pub title: String,
    pub summary: String,
    pub content: Payload,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reviewed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Task (and through it, workflow step) that produced this item.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub related_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reminder_sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating an approval item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewApproval {
    #[serde(rename = "type")]
    pub approval_type: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub content: Payload,
    pub created_by: String,
    #[serde(default)]
    pub related_task_id: Option<String>,
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl NewApproval {
    pub fn new(approval_type: &str, title: &str, created_by: &str) -> Self {
        Self {
            approval_type: approval_type.to_string(),
            title: title.to_string(),
            summary: String::new(),
            content: Payload::empty(),
            created_by: created_by.to_string(),
            related_task_id: None,
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn summary(mut self, summary: &str) -> Self {
        self.summary = summary.to_string();
        self
    }

    pub fn content(mut self, content: Payload) -> Self {
        self.content = content;
        self
    }

    pub fn related_task(mut self, task_id: &str) -> Self {
        self.related_task_id = Some(task_id.to_string());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}
