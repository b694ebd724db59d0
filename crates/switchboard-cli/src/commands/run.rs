//! `switchboard run` / `switchboard cycle` — drive the orchestrator.

use switchboard_core::state::AppState;

use super::print_value;

/// Register the orchestrator jobs and tick them until Ctrl+C.
pub async fn run(state: &AppState) -> Result<(), String> {
    state
        .orchestrator
        .register_jobs(&state.scheduler)
        .await
        .map_err(|e| e.to_string())?;
    state.scheduler.start().await;

    println!(
        "Switchboard running {} job(s). Press Ctrl+C to stop.",
        state.scheduler.job_names().await.len()
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| format!("Failed to listen for Ctrl+C: {}", e))?;

    println!("\nShutting down...");
    state.scheduler.stop().await;
    tracing::info!("[Switchboard] Scheduler stopped, in-flight jobs finished");
    Ok(())
}

/// Process the orchestrator queue once.
pub async fn cycle(state: &AppState) -> Result<(), String> {
    let report = state.orchestrator.run_cycle().await.map_err(|e| e.to_string())?;
    print_value(&report)
}
