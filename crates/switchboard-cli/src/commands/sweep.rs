//! `switchboard sweep` — One-off maintenance sweeps.

use serde_json::json;
use switchboard_core::state::AppState;

use super::print_json;

pub async fn stalled(state: &AppState) -> Result<(), String> {
    let stalled = state
        .orchestrator
        .detect_stalled_workflows()
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({
        "thresholdSecs": state.config.stalled_threshold_secs,
        "stalled": stalled,
    }));
    Ok(())
}

pub async fn approvals(state: &AppState) -> Result<(), String> {
    let reminded = state
        .orchestrator
        .sweep_approvals()
        .await
        .map_err(|e| e.to_string())?;
    print_json(&json!({
        "reminderAfterSecs": state.config.approval_reminder_after_secs,
        "reminded": reminded,
    }));
    Ok(())
}
