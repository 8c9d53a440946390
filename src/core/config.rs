//! Pipeline configuration from YAML

use crate::core::{trigger::TriggerRule, Pipeline};
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Top-level pipeline configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Pipeline name, also its identifier in run history
    pub name: String,

    /// Events that start a run
    #[serde(rename = "on", default)]
    pub trigger: TriggerRule,

    /// Build and publish settings
    #[serde(default)]
    pub settings: Settings,

    /// Variables available to every step
    #[serde(default)]
    env: HashMap<String, Value>,

    /// Defaults applied to steps that don't override them
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Pipeline steps, executed in declared order
    pub steps: Vec<StepConfig>,
}

/// Per-pipeline build and publish settings
///
/// Every field is exposed to expressions as `settings.<field>` and may itself
/// contain expressions, e.g. `image: "ghcr.io/${{ event.repository }}"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Language runtime, e.g. `java` or `node`
    #[serde(default)]
    pub runtime: Option<String>,

    /// Runtime version, e.g. `17` or `20`
    #[serde(default)]
    pub runtime_version: Option<String>,

    /// Build tool invocation producing the artifact
    #[serde(default)]
    pub build_command: Option<String>,

    /// Glob locating the artifact relative to the source tree
    #[serde(default)]
    pub artifact: Option<String>,

    /// Port the container image exposes
    #[serde(default)]
    pub port: Option<u16>,

    /// Registry host used for authentication
    #[serde(default)]
    pub registry: Option<String>,

    /// Registry base path, `registry-host/owner/repo`
    #[serde(default)]
    pub image: Option<String>,
}

impl Settings {
    /// Settings as `settings.<field>` environment entries
    pub fn to_env(&self) -> HashMap<String, String> {
        let fields = [
            ("runtime", self.runtime.clone()),
            ("runtime_version", self.runtime_version.clone()),
            ("build_command", self.build_command.clone()),
            ("artifact", self.artifact.clone()),
            ("port", self.port.map(|p| p.to_string())),
            ("registry", self.registry.clone()),
            ("image", self.image.clone()),
        ];

        fields
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (format!("settings.{}", k), v)))
            .collect()
    }
}

/// Step defaults
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Working directory relative to the workspace
    #[serde(default)]
    pub working_directory: Option<String>,

    /// Step timeout in seconds (no timeout when unset)
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Shell used for `run` steps
    #[serde(default)]
    pub shell: Option<String>,
}

/// Step configuration as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique step identifier
    pub id: String,

    /// Human-readable step name (defaults to the id)
    #[serde(default)]
    pub name: Option<String>,

    /// Shell command to run
    #[serde(default)]
    pub run: Option<String>,

    /// Action to call
    #[serde(default)]
    pub uses: Option<String>,

    /// Action inputs
    #[serde(default)]
    with: HashMap<String, Value>,

    /// Extra environment for this step
    #[serde(default)]
    env: HashMap<String, Value>,

    /// Working directory (overrides the default)
    #[serde(default)]
    pub working_directory: Option<String>,

    /// Shell for `run` (overrides the default)
    #[serde(default)]
    pub shell: Option<String>,

    /// What a failure of this step does to the run
    #[serde(default)]
    pub on_failure: FailurePolicy,

    /// Timeout for this step (overrides the default)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Failure policy of a step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop the run and mark it failed
    #[default]
    Abort,
    /// Record the failure and keep going
    Continue,
}

impl StepConfig {
    /// Action inputs as strings
    pub fn inputs(&self) -> HashMap<String, String> {
        stringify_values(&self.with)
    }

    /// Step environment as strings
    pub fn env(&self) -> HashMap<String, String> {
        stringify_values(&self.env)
    }
}

/// Convert YAML scalars to strings (`17` -> `"17"`, `true` -> `"true"`)
fn stringify_values(values: &HashMap<String, Value>) -> HashMap<String, String> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect()
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        Value::Sequence(items) => items
            .iter()
            .map(value_to_string)
            .collect::<Vec<_>>()
            .join("\n"),
        // Fallback: keep the YAML text
        _ => serde_yaml::to_string(value)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

impl PipelineConfig {
    /// Load pipeline configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid pipeline {}", path.display()))
    }

    /// Parse pipeline configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PipelineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name must not be empty");
        }

        if self.trigger.is_empty() {
            anyhow::bail!("Pipeline '{}' has no trigger: set 'on.push' or 'on.manual'", self.name);
        }

        for pattern in self.trigger.patterns() {
            glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid trigger pattern '{}'", pattern))?;
        }

        let id_format = Regex::new(r"^[A-Za-z0-9_-]+$")?;
        let mut seen_ids = HashSet::new();

        for step in &self.steps {
            if !id_format.is_match(&step.id) {
                anyhow::bail!(
                    "Invalid step ID '{}': use letters, digits, '-' and '_'",
                    step.id
                );
            }

            if !seen_ids.insert(&step.id) {
                anyhow::bail!("Duplicate step ID: {}", step.id);
            }

            match (&step.run, &step.uses) {
                (Some(_), Some(_)) => {
                    anyhow::bail!("Step '{}' sets both 'run' and 'uses'", step.id)
                }
                (None, None) => {
                    anyhow::bail!("Step '{}' needs either 'run' or 'uses'", step.id)
                }
                (Some(run), None) => {
                    if run.trim().is_empty() {
                        anyhow::bail!("Step '{}' has an empty 'run' command", step.id);
                    }
                    if !step.with.is_empty() {
                        anyhow::bail!("Step '{}' sets 'with' but is not an action step", step.id);
                    }
                }
                (None, Some(uses)) => {
                    if uses.trim().is_empty() {
                        anyhow::bail!("Step '{}' has an empty 'uses' reference", step.id);
                    }
                }
            }

            if step.timeout_secs == Some(0) {
                anyhow::bail!("Step '{}' timeout must be greater than zero", step.id);
            }
        }

        Ok(())
    }

    /// Variables as string map
    pub fn env_as_string_map(&self) -> HashMap<String, String> {
        stringify_values(&self.env)
    }

    /// Action references used by the pipeline
    pub fn action_refs(&self) -> Vec<&str> {
        self.steps.iter().filter_map(|s| s.uses.as_deref()).collect()
    }

    /// Convert config to a Pipeline domain model
    pub fn to_pipeline(&self) -> Pipeline {
        Pipeline::from_config(self)
    }
}
