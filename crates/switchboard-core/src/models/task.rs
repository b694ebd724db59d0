use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payload::Payload;

/// Highest priority a task can carry.
pub const PRIORITY_HIGHEST: u8 = 1;
/// Lowest priority a task can carry.
pub const PRIORITY_LOWEST: u8 = 5;
pub const DEFAULT_PRIORITY: u8 = 3;

/// Payload keys the workflow engine writes into step tasks.
pub const WORKFLOW_ID_KEY: &str = "workflow_id";
pub const WORKFLOW_STEP_KEY: &str = "workflow_step";
pub const WORKFLOW_DATA_KEY: &str = "workflow_data";

/// Named worker roles. Each owns and executes the tasks addressed to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Content,
    Creative,
    PaidMedia,
    Seo,
    Analytics,
    Research,
}

impl AgentRole {
    pub const ALL: [AgentRole; 7] = [
        AgentRole::Orchestrator,
        AgentRole::Content,
        AgentRole::Creative,
        AgentRole::PaidMedia,
        AgentRole::Seo,
        AgentRole::Analytics,
        AgentRole::Research,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Orchestrator => "orchestrator",
            Self::Content => "content",
            Self::Creative => "creative",
            Self::PaidMedia => "paid_media",
            Self::Seo => "seo",
            Self::Analytics => "analytics",
            Self::Research => "research",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "orchestrator" => Some(Self::Orchestrator),
            "content" => Some(Self::Content),
            "creative" => Some(Self::Creative),
            "paid_media" => Some(Self::PaidMedia),
            "seo" => Some(Self::Seo),
            "analytics" => Some(Self::Analytics),
            "research" => Some(Self::Research),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of work a task represents.
///
/// Known kinds get their own variant; anything else round-trips through
/// `Custom` so new agents can introduce task kinds without touching this enum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    // Orchestrator kinds
    StartWorkflow,
    AdvanceWorkflow,
    DistributeTask,
    SweepApprovals,
    // Agent kinds used by the built-in workflows
    CreateContentBrief,
    WriteBlogPost,
    ReviewContent,
    PublishContent,
    MarketResearch,
    CreateAdCreatives,
    LaunchCampaign,
    SetupTracking,
    CompileMetrics,
    WriteReportSummary,
    Custom(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            Self::StartWorkflow => "start_workflow",
            Self::AdvanceWorkflow => "advance_workflow",
            Self::DistributeTask => "distribute_task",
            Self::SweepApprovals => "sweep_approvals",
            Self::CreateContentBrief => "create_content_brief",
            Self::WriteBlogPost => "write_blog_post",
            Self::ReviewContent => "review_content",
            Self::PublishContent => "publish_content",
            Self::MarketResearch => "market_research",
            Self::CreateAdCreatives => "create_ad_creatives",
            Self::LaunchCampaign => "launch_campaign",
            Self::SetupTracking => "setup_tracking",
            Self::CompileMetrics => "compile_metrics",
            Self::WriteReportSummary => "write_report_summary",
            Self::Custom(s) => s.as_str(),
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "start_workflow" => Self::StartWorkflow,
            "advance_workflow" => Self::AdvanceWorkflow,
            "distribute_task" => Self::DistributeTask,
            "sweep_approvals" => Self::SweepApprovals,
            "create_content_brief" => Self::CreateContentBrief,
            "write_blog_post" => Self::WriteBlogPost,
            "review_content" => Self::ReviewContent,
            "publish_content" => Self::PublishContent,
            "market_research" => Self::MarketResearch,
            "create_ad_creatives" => Self::CreateAdCreatives,
            "launch_campaign" => Self::LaunchCampaign,
            "setup_tracking" => Self::SetupTracking,
            "compile_metrics" => Self::CompileMetrics,
            "write_report_summary" => Self::WriteReportSummary,
            other => Self::Custom(other.to_string()),
        }
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self::parse(&s)
    }
}

impl From<TaskType> for String {
    fn from(t: TaskType) -> Self {
        t.as_str().to_string()
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "complete" => Some(Self::Complete),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// A unit of work for exactly one agent. Rows are never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTask {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub priority: u8,
    pub status: TaskStatus,
    pub assigned_agent: AgentRole,
    pub payload: Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,
    pub created_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_at: Option<DateTime<Utc>>,
    /// Earliest time a retried task may be picked up again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentTask {
    pub fn new(
        assigned_agent: AgentRole,
        task_type: TaskType,
        payload: Payload,
        priority: u8,
        created_by: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type,
            priority,
            status: TaskStatus::Pending,
            assigned_agent,
            payload,
            result: None,
            created_by: created_by.to_string(),
            due_at: None,
            not_before: None,
            completed_at: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Workflow instance this task was dispatched for, if any.
    pub fn workflow_id(&self) -> Option<&str> {
        self.payload.get_str(WORKFLOW_ID_KEY)
    }

    /// Step index within the workflow this task was dispatched for, if any.
    pub fn workflow_step(&self) -> Option<usize> {
        self.payload
            .get(WORKFLOW_STEP_KEY)
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
    }
}

/// Input for creating a new task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub assigned_agent: AgentRole,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(default)]
    pub payload: Payload,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_created_by")]
    pub created_by: String,
    #[serde(default)]
    pub due_at: Option<DateTime<Utc>>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn default_created_by() -> String {
    AgentRole::Orchestrator.as_str().to_string()
}

impl NewTask {
    pub fn new(assigned_agent: AgentRole, task_type: TaskType, payload: Payload) -> Self {
        Self {
            assigned_agent,
            task_type,
            payload,
            priority: DEFAULT_PRIORITY,
            created_by: default_created_by(),
            due_at: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn created_by(mut self, created_by: &str) -> Self {
        self.created_by = created_by.to_string();
        self
    }

    pub fn due_at(mut self, due_at: DateTime<Utc>) -> Self {
        self.due_at = Some(due_at);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_type_roundtrips_custom_kinds() {
        assert_eq!(TaskType::parse("write_blog_post"), TaskType::WriteBlogPost);
        let custom = TaskType::parse("score_lead");
        assert_eq!(custom, TaskType::Custom("score_lead".into()));
        assert_eq!(custom.as_str(), "score_lead");

        let json = serde_json::to_value(TaskType::CreateContentBrief).unwrap();
        assert_eq!(json, json!("create_content_brief"));
    }

    #[test]
    fn test_agent_role_parse() {
        assert_eq!(AgentRole::from_str("paid_media"), Some(AgentRole::PaidMedia));
        assert_eq!(AgentRole::from_str("SEO"), Some(AgentRole::Seo));
        assert_eq!(AgentRole::from_str("billing"), None);
        for role in AgentRole::ALL {
            assert_eq!(AgentRole::from_str(role.as_str()), Some(role));
        }
    }

    #[test]
    fn test_workflow_keys_read_from_payload() {
        let payload = Payload::new(json!({ "workflow_id": "wf-1", "workflow_step": 2 }));
        let task = AgentTask::new(AgentRole::Content, TaskType::WriteBlogPost, payload, 3, "orchestrator");
        assert_eq!(task.workflow_id(), Some("wf-1"));
        assert_eq!(task.workflow_step(), Some(2));
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 0);
    }

    #[test]
    fn test_serializes_type_field() {
        let task = AgentTask::new(AgentRole::Seo, TaskType::CreateContentBrief, Payload::empty(), 1, "orchestrator");
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "create_content_brief");
        assert_eq!(value["assignedAgent"], "seo");
        assert_eq!(value["status"], "pending");
    }
}
