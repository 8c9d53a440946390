//! Pipeline domain model

use crate::core::{
    config::{PipelineConfig, Settings},
    step::Step,
    trigger::{Event, TriggerRule},
};
use std::collections::HashMap;

/// A pipeline definition
///
/// Built once from configuration and never mutated by a run; runs only
/// borrow it.
#[derive(Debug, Clone)]
pub struct Pipeline {
    /// Pipeline name
    pub name: String,

    /// Events that start a run
    pub trigger: TriggerRule,

    /// Build and publish settings
    pub settings: Settings,

    /// Variables available to all steps
    pub env: HashMap<String, String>,

    /// Steps in execution order
    pub steps: Vec<Step>,
}

impl Pipeline {
    /// Create a pipeline from configuration
    pub fn from_config(config: &PipelineConfig) -> Self {
        let steps = config
            .steps
            .iter()
            .map(|step_config| Step::from_config(step_config, &config.defaults))
            .collect();

        Pipeline {
            name: config.name.clone(),
            trigger: config.trigger.clone(),
            settings: config.settings.clone(),
            env: config.env_as_string_map(),
            steps,
        }
    }

    /// A pipeline built in code
    pub fn new(name: &str, trigger: TriggerRule, steps: Vec<Step>) -> Self {
        Pipeline {
            name: name.to_string(),
            trigger,
            settings: Settings::default(),
            env: HashMap::new(),
            steps,
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Get a step by ID
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Position of a step in execution order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    /// Whether `event` should start a run of this pipeline
    pub fn is_triggered_by(&self, event: &Event) -> bool {
        self.trigger.matches(event)
    }
}
