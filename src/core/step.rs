//! Step domain model

use crate::core::{
    config::{DefaultsConfig, FailurePolicy, StepConfig},
    expression::{self, ExpressionError},
};
use std::collections::HashMap;
use std::time::Duration;

/// Shell used for `run` steps when neither the step nor the defaults name one
pub const DEFAULT_SHELL: &str = "sh";

/// What a step does when executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    /// A command run through a shell
    Shell { run: String, shell: String },
    /// A call to a registered action
    Action { uses: String },
}

/// A single step in a pipeline
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique step identifier
    pub id: String,

    /// Display name
    pub name: String,

    pub kind: StepKind,

    /// Action inputs (unresolved)
    pub inputs: HashMap<String, String>,

    /// Extra environment (unresolved)
    pub env: HashMap<String, String>,

    /// Working directory relative to the workspace
    pub working_directory: Option<String>,

    pub failure_policy: FailurePolicy,

    /// Timeout in seconds
    pub timeout_secs: Option<u64>,
}

impl Step {
    /// Create a step from a step config
    pub fn from_config(config: &StepConfig, defaults: &DefaultsConfig) -> Self {
        let kind = match (&config.run, &config.uses) {
            (Some(run), _) => StepKind::Shell {
                run: run.clone(),
                shell: config
                    .shell
                    .clone()
                    .or_else(|| defaults.shell.clone())
                    .unwrap_or_else(|| DEFAULT_SHELL.to_string()),
            },
            (None, uses) => StepKind::Action {
                uses: uses.clone().unwrap_or_default(),
            },
        };

        Step {
            id: config.id.clone(),
            name: config.name.clone().unwrap_or_else(|| config.id.clone()),
            kind,
            inputs: config.inputs(),
            env: config.env(),
            working_directory: config
                .working_directory
                .clone()
                .or_else(|| defaults.working_directory.clone()),
            failure_policy: config.on_failure,
            timeout_secs: config.timeout_secs.or(defaults.timeout_secs),
        }
    }

    /// A shell step with default settings
    pub fn shell(id: &str, run: &str) -> Self {
        Step {
            id: id.to_string(),
            name: id.to_string(),
            kind: StepKind::Shell {
                run: run.to_string(),
                shell: DEFAULT_SHELL.to_string(),
            },
            inputs: HashMap::new(),
            env: HashMap::new(),
            working_directory: None,
            failure_policy: FailurePolicy::Abort,
            timeout_secs: None,
        }
    }

    /// An action step with default settings
    pub fn action(id: &str, uses: &str) -> Self {
        Step {
            kind: StepKind::Action {
                uses: uses.to_string(),
            },
            ..Self::shell(id, "")
        }
    }

    pub fn with_input(mut self, key: &str, value: &str) -> Self {
        self.inputs.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Resolve action inputs against the run environment
    pub fn resolve_inputs(
        &self,
        env: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ExpressionError> {
        expression::render_map(&self.inputs, env)
    }

    /// Resolve the step environment against the run environment
    pub fn resolve_env(
        &self,
        env: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, ExpressionError> {
        expression::render_map(&self.env, env)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match &self.kind {
            StepKind::Shell { run, .. } => {
                let first_line = run.lines().next().unwrap_or_default();
                format!("run: {}", first_line)
            }
            StepKind::Action { uses } => format!("uses: {}", uses),
        }
    }
}
