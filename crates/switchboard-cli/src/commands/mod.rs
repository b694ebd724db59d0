//! CLI command implementations.
//!
//! Each submodule corresponds to a top-level CLI command and drives the
//! switchboard-core services through `AppState`.

pub mod approval;
pub mod jobs;
pub mod run;
pub mod sweep;
pub mod task;
pub mod workflow;

use serde::Serialize;
use switchboard_core::state::AppState;
use switchboard_core::{Database, EngineConfig};

/// Open the database, load the engine configuration and wire the services.
pub async fn init_state(db_path: &str, config_path: Option<&str>) -> AppState {
    let config = match config_path {
        Some(path) => EngineConfig::from_file(path).unwrap_or_else(|e| {
            eprintln!("Failed to load config '{}': {}", path, e);
            std::process::exit(1);
        }),
        None => EngineConfig::default(),
    };

    let db = Database::open(db_path).unwrap_or_else(|e| {
        eprintln!("Failed to open database '{}': {}", db_path, e);
        std::process::exit(1);
    });

    switchboard_core::bootstrap(db, config).await.unwrap_or_else(|e| {
        eprintln!("Failed to initialize engine: {}", e);
        std::process::exit(1);
    })
}

/// Pretty-print a JSON value to stdout.
pub fn print_json(value: &serde_json::Value) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
    );
}

/// Serialize and pretty-print any model.
pub fn print_value<T: Serialize>(value: &T) -> Result<(), String> {
    let value = serde_json::to_value(value).map_err(|e| format!("Failed to serialize output: {}", e))?;
    print_json(&value);
    Ok(())
}

/// Parse a `--payload`/`--result`/`--content` argument.
pub fn parse_json_arg(name: &str, raw: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(raw).map_err(|e| format!("--{} is not valid JSON: {}", name, e))
}
