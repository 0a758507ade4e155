use crate::core::errors::{CrossflowError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the orchestration loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Retry a pass with breakpoints disabled when it executed nothing
    #[serde(default = "default_true")]
    pub enable_safety_net: bool,
    /// Dispose a group's executor once every stage of the group has completed
    #[serde(default = "default_true")]
    pub dispose_finished_executors: bool,
    /// Log the full task plan of each stage before running it
    #[serde(default)]
    pub log_stage_plans: bool,
    /// Optional label attached to every run span
    #[serde(default)]
    pub run_label: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enable_safety_net: true,
            dispose_finished_executors: true,
            log_stage_plans: false,
            run_label: None,
        }
    }
}

impl OrchestratorConfig {
    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if let Some(label) = &self.run_label {
            if label.trim().is_empty() {
                return Err(CrossflowError::configuration_field(
                    "run_label must not be blank",
                    "run_label",
                ));
            }
        }
        Ok(())
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }
}
