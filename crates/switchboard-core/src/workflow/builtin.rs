//! Built-in marketing workflows, registered at startup.

use serde_json::json;

use super::definition::{Continuation, WorkflowDefinition, WorkflowStep};
use crate::models::task::{AgentRole, TaskType};

pub const NEW_BLOG_POST: &str = "new_blog_post";
pub const CAMPAIGN_LAUNCH: &str = "campaign_launch";
pub const WEEKLY_REPORT: &str = "weekly_report";

pub fn builtin_definitions() -> Vec<WorkflowDefinition> {
    vec![new_blog_post(), campaign_launch(), weekly_report()]
}

/// Brief, draft, review, publish.
pub fn new_blog_post() -> WorkflowDefinition {
    WorkflowDefinition::new(
        NEW_BLOG_POST,
        vec![
            WorkflowStep::new(AgentRole::Seo, TaskType::CreateContentBrief)
                .named("Content brief")
                .with_payload(json!({ "include_keywords": true })),
            WorkflowStep::new(AgentRole::Content, TaskType::WriteBlogPost).named("Draft"),
            WorkflowStep::new(AgentRole::Content, TaskType::ReviewContent)
                .named("Editorial review")
                .continue_on(Continuation::TaskComplete),
            WorkflowStep::new(AgentRole::Content, TaskType::PublishContent)
                .named("Publish")
                .continue_on(Continuation::TaskComplete),
        ],
    )
    .describe("SEO brief, draft, editorial review and publication of a blog post")
}

pub fn campaign_launch() -> WorkflowDefinition {
    WorkflowDefinition::new(
        CAMPAIGN_LAUNCH,
        vec![
            WorkflowStep::new(AgentRole::Research, TaskType::MarketResearch)
                .named("Audience research")
                .continue_on(Continuation::TaskComplete),
            WorkflowStep::new(AgentRole::Creative, TaskType::CreateAdCreatives)
                .named("Ad creatives")
                .with_payload(json!({ "variants": 3 })),
            WorkflowStep::new(AgentRole::PaidMedia, TaskType::LaunchCampaign)
                .named("Launch")
                .with_priority(2),
            WorkflowStep::new(AgentRole::Analytics, TaskType::SetupTracking)
                .named("Tracking")
                .continue_on(Continuation::TaskComplete),
        ],
    )
    .describe("Research, creatives, paid launch and conversion tracking")
}

pub fn weekly_report() -> WorkflowDefinition {
    WorkflowDefinition::new(
        WEEKLY_REPORT,
        vec![
            WorkflowStep::new(AgentRole::Analytics, TaskType::CompileMetrics)
                .named("Compile metrics")
                .with_payload(json!({ "period_days": 7 }))
                .continue_on(Continuation::TaskComplete),
            WorkflowStep::new(AgentRole::Content, TaskType::WriteReportSummary).named("Summary"),
        ],
    )
    .describe("Weekly performance metrics with a written summary")
}
