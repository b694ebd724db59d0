//! `switchboard jobs` — Scheduled job health and manual triggers.

use serde_json::json;
use switchboard_core::state::AppState;

use super::{print_json, print_value};

/// Jobs recorded by the last daemon registration, with run history.
pub async fn list(state: &AppState) -> Result<(), String> {
    let jobs = state.scheduler.jobs().await.map_err(|e| e.to_string())?;
    print_value(&jobs)
}

/// Register the orchestrator jobs in this process and run one immediately.
pub async fn run_now(state: &AppState, name: &str) -> Result<(), String> {
    state
        .orchestrator
        .register_jobs(&state.scheduler)
        .await
        .map_err(|e| e.to_string())?;
    let status = state.scheduler.run_now(name).await.map_err(|e| e.to_string())?;
    print_json(&json!({ "job": name, "status": status.as_str() }));
    Ok(())
}
