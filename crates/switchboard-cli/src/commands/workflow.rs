//! `switchboard workflow` — Workflow instances and definitions.

use serde_json::json;
use switchboard_core::models::workflow::WorkflowStatus;
use switchboard_core::state::AppState;
use switchboard_core::workflow::WorkflowDefinition;

use super::{parse_json_arg, print_json, print_value};

pub async fn start(state: &AppState, workflow_type: &str, payload: &str) -> Result<(), String> {
    let payload = parse_json_arg("payload", payload)?;
    let instance = state
        .workflow_engine
        .start(workflow_type, payload)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&instance)
}

pub async fn status(state: &AppState, workflow_id: &str) -> Result<(), String> {
    let instance = state
        .workflow_engine
        .get_status(workflow_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("Workflow {} not found", workflow_id))?;
    print_value(&instance)
}

pub async fn list(state: &AppState, status: Option<&str>) -> Result<(), String> {
    let status = status
        .map(|s| WorkflowStatus::from_str(s).ok_or_else(|| format!("Unknown workflow status '{}'", s)))
        .transpose()?;
    let instances = state.workflow_engine.list(status).await.map_err(|e| e.to_string())?;
    print_value(&instances)
}

pub async fn pause(state: &AppState, workflow_id: &str) -> Result<(), String> {
    let instance = state
        .workflow_engine
        .pause(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&instance)
}

pub async fn resume(state: &AppState, workflow_id: &str) -> Result<(), String> {
    let (instance, outcome) = state
        .workflow_engine
        .resume(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({ "instance": instance, "advance": outcome }));
    Ok(())
}

pub async fn advance(state: &AppState, workflow_id: &str) -> Result<(), String> {
    let outcome = state
        .workflow_engine
        .advance(workflow_id)
        .await
        .map_err(|e| e.to_string())?;
    print_value(&outcome)
}

/// List registered workflow definitions.
pub fn definitions(state: &AppState) -> Result<(), String> {
    let defs: Vec<_> = state
        .workflow_engine
        .registry()
        .definitions()
        .iter()
        .map(|def| {
            json!({
                "name": def.name,
                "description": def.description,
                "version": def.version,
                "steps": def.steps.iter().map(|s| json!({
                    "name": s.label(),
                    "agent": s.agent,
                    "taskType": s.task_type,
                    "continueOn": s.continue_on,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    print_json(&json!(defs));
    Ok(())
}

/// Validate a workflow YAML file without registering it.
pub fn validate(workflow_file: &str) -> Result<(), String> {
    let def = WorkflowDefinition::from_file(workflow_file).map_err(|e| e.to_string())?;
    println!("✅ Workflow is valid: {}", def.name);
    for (i, step) in def.steps.iter().enumerate() {
        println!(
            "   {}. {} → {} ({}, continues on {:?})",
            i + 1,
            step.label(),
            step.agent,
            step.task_type,
            step.continue_on
        );
    }
    Ok(())
}
