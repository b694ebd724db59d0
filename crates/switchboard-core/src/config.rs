//! Engine configuration, loaded from an optional YAML file.
//!
//! ```yaml
//! stalled_threshold_secs: 3600
//! approval_reminder_after_secs: 86400
//! retry:
//!   max_attempts: 3
//!   base_backoff_secs: 60
//!   max_backoff_secs: 3600
//! jobs:
//!   orchestrator_cycle: "*/5 * * * *"
//!   stalled_sweep: "0 * * * *"
//!   approval_sweep: "30 * * * *"
//! workflows_dir: "./workflows"
//! ```
//!
//! Every field is optional; an empty document yields [`EngineConfig::default`].
//! Durations are capped at [`MAX_DURATION_SECS`].

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Upper bound for every configured duration (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 3600;

/// `secs` as a signed duration, clamped to [`MAX_DURATION_SECS`].
fn bounded_duration(secs: u64) -> chrono::Duration {
    let secs = secs.min(MAX_DURATION_SECS) as i64;
    chrono::Duration::try_seconds(secs).unwrap_or_else(|| chrono::Duration::days(3650))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// A running workflow untouched for longer than this is reported as stalled.
    #[serde(default = "default_stalled_threshold_secs")]
    pub stalled_threshold_secs: u64,

    /// Pending approvals older than this become reminder candidates.
    #[serde(default = "default_approval_reminder_after_secs")]
    pub approval_reminder_after_secs: u64,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub jobs: JobSchedules,

    /// Extra workflow definitions (`*.yaml` / `*.yml`) registered at startup.
    #[serde(default)]
    pub workflows_dir: Option<String>,
}

fn default_stalled_threshold_secs() -> u64 {
    3600
}

fn default_approval_reminder_after_secs() -> u64 {
    24 * 3600
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stalled_threshold_secs: default_stalled_threshold_secs(),
            approval_reminder_after_secs: default_approval_reminder_after_secs(),
            retry: RetryPolicy::default(),
            jobs: JobSchedules::default(),
            workflows_dir: None,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::Config(format!("Failed to parse config YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a file path.
    pub fn from_file(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("Failed to read config file '{}': {}", path, e)))?;
        Self::from_yaml(&content)
    }

    /// Reject values the engine cannot schedule with.
    pub fn validate(&self) -> Result<(), CoreError> {
        let durations = [
            ("stalled_threshold_secs", self.stalled_threshold_secs),
            ("approval_reminder_after_secs", self.approval_reminder_after_secs),
            ("retry.base_backoff_secs", self.retry.base_backoff_secs),
            ("retry.max_backoff_secs", self.retry.max_backoff_secs),
        ];
        for (field, secs) in durations {
            if secs > MAX_DURATION_SECS {
                return Err(CoreError::Config(format!(
                    "{} must be at most {} seconds, got {}",
                    field, MAX_DURATION_SECS, secs
                )));
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(CoreError::Config("retry.max_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn stalled_threshold(&self) -> chrono::Duration {
        bounded_duration(self.stalled_threshold_secs)
    }

    pub fn approval_reminder_after(&self) -> chrono::Duration {
        bounded_duration(self.approval_reminder_after_secs)
    }
}

/// Bounded retry with exponential backoff for failed tasks.
///
/// `max_attempts = 1` disables retries: the first failure is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_secs")]
    pub base_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_backoff_secs() -> u64 {
    60
}

fn default_max_backoff_secs() -> u64 {
    3600
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_secs: default_base_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never re-enqueues a failed task.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Whether a task that has now failed `attempts` times gets another go.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the next attempt after the `attempts`-th failure:
    /// `base * 2^(attempts-1)`, capped at `max_backoff_secs` and at
    /// [`MAX_DURATION_SECS`].
    pub fn backoff_for(&self, attempts: u32) -> chrono::Duration {
        let exponent = attempts.saturating_sub(1).min(32);
        let secs = self
            .base_backoff_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_secs);
        bounded_duration(secs)
    }
}

/// Cron expressions for the orchestrator's own jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSchedules {
    #[serde(default = "default_orchestrator_cycle")]
    pub orchestrator_cycle: String,
    #[serde(default = "default_stalled_sweep")]
    pub stalled_sweep: String,
    #[serde(default = "default_approval_sweep")]
    pub approval_sweep: String,
}

fn default_orchestrator_cycle() -> String {
    "*/5 * * * *".to_string()
}

fn default_stalled_sweep() -> String {
    "0 * * * *".to_string()
}

fn default_approval_sweep() -> String {
    "30 * * * *".to_string()
}

impl Default for JobSchedules {
    fn default() -> Self {
        Self {
            orchestrator_cycle: default_orchestrator_cycle(),
            stalled_sweep: default_stalled_sweep(),
            approval_sweep: default_approval_sweep(),
        }
    }
}
