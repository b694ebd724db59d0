//! `switchboard approval` — Human review queue.

use switchboard_core::models::approval::{ApprovalStatus, NewApproval};
use switchboard_core::models::payload::Payload;
use switchboard_core::state::AppState;

use super::{parse_json_arg, print_value};

pub async fn list(state: &AppState) -> Result<(), String> {
    let items = state.approval_gate.list_pending().await.map_err(|e| e.to_string())?;
    print_value(&items)
}

pub async fn get(state: &AppState, id: &str) -> Result<(), String> {
    let item = state.approval_gate.get(id).await.map_err(|e| e.to_string())?;
    print_value(&item)
}

#[allow(clippy::too_many_arguments)]
pub async fn create(
    state: &AppState,
    approval_type: &str,
    title: &str,
    summary: &str,
    content: &str,
    task_id: Option<&str>,
    priority: u8,
    created_by: &str,
) -> Result<(), String> {
    let mut input = NewApproval::new(approval_type, title, created_by)
        .summary(summary)
        .content(Payload::new(parse_json_arg("content", content)?))
        .with_priority(priority);
    if let Some(task_id) = task_id {
        input = input.related_task(task_id);
    }

    let item = state
        .approval_gate
        .create_approval(input)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&item)
}

pub async fn resolve(
    state: &AppState,
    id: &str,
    status: &str,
    reviewer: &str,
    feedback: Option<String>,
) -> Result<(), String> {
    let status = ApprovalStatus::from_str(status)
        .filter(ApprovalStatus::is_decision)
        .ok_or_else(|| {
            format!(
                "Unknown decision '{}'. Use approved, rejected or revision_requested",
                status
            )
        })?;
    let item = state
        .approval_gate
        .resolve(id, status, reviewer, feedback)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&item)
}

pub async fn reminded(state: &AppState, id: &str) -> Result<(), String> {
    let item = state
        .approval_gate
        .record_reminder(id)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&item)
}

pub async fn resubmit(state: &AppState, id: &str, content: Option<&str>) -> Result<(), String> {
    let content = content
        .map(|raw| parse_json_arg("content", raw).map(Payload::new))
        .transpose()?;
    let item = state
        .approval_gate
        .resubmit(id, content)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&item)
}
