//! Workflow definitions and the in-memory registry they live in.
//!
//! A definition is an ordered list of steps, each addressed to one agent:
//!
//! ```yaml
//! name: "product_launch"
//! description: "Research, creatives, then paid media"
//! steps:
//!   - agent: research
//!     task_type: market_research
//!     continue_on: task_complete
//!   - agent: creative
//!     task_type: create_ad_creatives
//!     payload:
//!       formats: ["square", "story"]
//!   - agent: paid_media
//!     task_type: launch_campaign
//!     priority: 2
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::models::task::{
    AgentRole, TaskType, DEFAULT_PRIORITY, PRIORITY_HIGHEST, PRIORITY_LOWEST, WORKFLOW_DATA_KEY,
    WORKFLOW_ID_KEY, WORKFLOW_STEP_KEY,
};

/// What moves a workflow past a dispatched step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Continuation {
    /// A reviewer approves an approval item linked to the step's task.
    #[default]
    Approval,
    /// The step's task completes.
    TaskComplete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    #[serde(default)]
    pub name: Option<String>,

    /// Agent the step's task is assigned to.
    pub agent: AgentRole,

    pub task_type: TaskType,

    /// Template merged under the engine's `workflow_*` keys.
    #[serde(default)]
    pub payload: Map<String, Value>,

    #[serde(default)]
    pub continue_on: Continuation,

    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

impl WorkflowStep {
    pub fn new(agent: AgentRole, task_type: TaskType) -> Self {
        Self {
            name: None,
            agent,
            task_type,
            payload: Map::new(),
            continue_on: Continuation::default(),
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        if let Value::Object(map) = payload {
            self.payload = map;
        }
        self
    }

    pub fn continue_on(mut self, continuation: Continuation) -> Self {
        self.continue_on = continuation;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Label for logs: the step name, or its task type.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.task_type.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Registry key, also stored as the instance's `workflow_type`.
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_version")]
    pub version: String,

    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl WorkflowDefinition {
    pub fn new(name: &str, steps: Vec<WorkflowStep>) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            version: default_version(),
            steps,
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    /// Parse a workflow definition from a YAML string. An unknown step
    /// agent is rejected here.
    pub fn from_yaml(yaml: &str) -> Result<Self, CoreError> {
        let def: Self = serde_yaml::from_str(yaml)
            .map_err(|e| CoreError::Config(format!("Failed to parse workflow YAML: {}", e)))?;
        def.validate()?;
        Ok(def)
    }

    pub fn from_file(path: &str) -> Result<Self, CoreError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("Failed to read workflow file '{}': {}", path, e)))?;
        Self::from_yaml(&content)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::Config("Workflow name must not be empty".to_string()));
        }
        for (index, step) in self.steps.iter().enumerate() {
            if step.task_type.as_str().trim().is_empty() {
                return Err(CoreError::Config(format!(
                    "Workflow '{}' step {} has an empty task_type",
                    self.name, index
                )));
            }
            if !(PRIORITY_HIGHEST..=PRIORITY_LOWEST).contains(&step.priority) {
                return Err(CoreError::Config(format!(
                    "Workflow '{}' step {} has priority {} outside {}..={}",
                    self.name, index, step.priority, PRIORITY_HIGHEST, PRIORITY_LOWEST
                )));
            }
            for key in [WORKFLOW_ID_KEY, WORKFLOW_STEP_KEY, WORKFLOW_DATA_KEY] {
                if step.payload.contains_key(key) {
                    return Err(CoreError::Config(format!(
                        "Workflow '{}' step {} uses reserved payload key '{}'",
                        self.name, index, key
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Process-wide map of workflow type to definition.
#[derive(Default)]
pub struct WorkflowRegistry {
    definitions: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in marketing workflows.
    pub fn with_builtins() -> Result<Self, CoreError> {
        let registry = Self::new();
        for def in super::builtin::builtin_definitions() {
            registry.register(def)?;
        }
        Ok(registry)
    }

    /// Register a definition. Re-registering a name replaces the old one;
    /// running instances pick up the new steps on their next advance.
    pub fn register(&self, def: WorkflowDefinition) -> Result<(), CoreError> {
        def.validate()?;
        let mut defs = self
            .definitions
            .write()
            .map_err(|e| CoreError::Internal(format!("Workflow registry lock poisoned: {}", e)))?;
        let name = def.name.clone();
        let steps = def.steps.len();
        if defs.insert(name.clone(), Arc::new(def)).is_some() {
            tracing::info!("[WorkflowRegistry] Replaced definition: {} ({} steps)", name, steps);
        } else {
            tracing::debug!("[WorkflowRegistry] Registered definition: {} ({} steps)", name, steps);
        }
        Ok(())
    }

    /// Register `steps` under `workflow_type`.
    pub fn register_steps(&self, workflow_type: &str, steps: Vec<WorkflowStep>) -> Result<(), CoreError> {
        self.register(WorkflowDefinition::new(workflow_type, steps))
    }

    /// Look up a definition. An unknown type is a configuration fault.
    pub fn get(&self, workflow_type: &str) -> Result<Arc<WorkflowDefinition>, CoreError> {
        let defs = self
            .definitions
            .read()
            .map_err(|e| CoreError::Internal(format!("Workflow registry lock poisoned: {}", e)))?;
        defs.get(workflow_type)
            .cloned()
            .ok_or_else(|| CoreError::Config(format!("Unknown workflow type '{}'", workflow_type)))
    }

    /// All definitions, sorted by name.
    pub fn definitions(&self) -> Vec<Arc<WorkflowDefinition>> {
        let Ok(defs) = self.definitions.read() else {
            return Vec::new();
        };
        let mut all: Vec<_> = defs.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn names(&self) -> Vec<String> {
        self.definitions().iter().map(|d| d.name.clone()).collect()
    }

    /// Load every `*.yaml` / `*.yml` definition in `dir`.
    pub fn load_dir(&self, dir: &str) -> Result<usize, CoreError> {
        let dir_path = Path::new(dir);
        if !dir_path.is_dir() {
            return Err(CoreError::Config(format!("Workflow directory '{}' does not exist", dir)));
        }

        let mut count = 0;
        for entry in std::fs::read_dir(dir_path)
            .map_err(|e| CoreError::Config(format!("Failed to read directory '{}': {}", dir, e)))?
        {
            let entry = entry.map_err(|e| CoreError::Config(format!("Directory entry error: {}", e)))?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !matches!(ext, "yaml" | "yml") {
                continue;
            }

            let def = WorkflowDefinition::from_file(path.to_str().unwrap_or(""))?;
            tracing::info!("[WorkflowRegistry] Loaded workflow: {} from {}", def.name, path.display());
            self.register(def)?;
            count += 1;
        }

        Ok(count)
    }
}
