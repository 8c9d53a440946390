//! Reusable step implementations
//!
//! An action turns a map of string inputs into a map of string outputs.
//! Steps reference actions by name (`uses: image-push`); the registry maps
//! names to implementations.

pub mod artifact;
pub mod checkout;
pub mod publish;
pub mod toolchain;

use crate::core::{expression, Artifact, PipelineError, RunContext};
use crate::runtime::{ContainerRuntime, ProcessRunner};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub use artifact::ArtifactBuilder;
pub use checkout::Checkout;
pub use publish::{
    compute_tags, ImageBuild, ImageMetadata, ImagePublisher, ImagePush, PublishImage,
    PublishedImage, RegistryAuth, RegistryLogin,
};
pub use toolchain::SetupToolchain;

/// Resolved inputs of an action step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionInputs {
    values: HashMap<String, String>,
}

impl ActionInputs {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    /// Get an input; blank values count as unset
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Get an input or fail the step
    pub fn require(&self, action: &str, key: &str) -> Result<&str, PipelineError> {
        self.get(key).ok_or_else(|| {
            PipelineError::StepError(format!("{}: missing required input '{}'", action, key))
        })
    }

    /// Get an input, falling back to `settings.<field>`
    pub fn or_setting(
        &self,
        key: &str,
        ctx: &ActionContext<'_>,
        field: &str,
    ) -> Result<Option<String>, PipelineError> {
        match self.get(key) {
            Some(value) => Ok(Some(value.to_string())),
            None => ctx.setting(field),
        }
    }
}

impl From<HashMap<String, String>> for ActionInputs {
    fn from(values: HashMap<String, String>) -> Self {
        Self::new(values)
    }
}

/// What an action sees of the run
pub struct ActionContext<'a> {
    pub step_id: &'a str,
    pub run: &'a RunContext,

    /// Directory the step runs in
    pub working_dir: PathBuf,

    /// Environment for child processes
    pub env: HashMap<String, String>,

    pub timeout: Option<Duration>,
}

impl<'a> ActionContext<'a> {
    pub fn new(step_id: &'a str, run: &'a RunContext) -> Self {
        Self {
            step_id,
            run,
            working_dir: run.workspace.clone(),
            env: run.exported_env(),
            timeout: None,
        }
    }

    /// Resolve a path relative to the working directory
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        if path.is_empty() || path == "." {
            return self.working_dir.clone();
        }
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.working_dir.join(p)
        }
    }

    /// Commit SHA of the triggering event
    pub fn sha(&self) -> &str {
        &self.run.event.sha
    }

    /// Rendered value of `settings.<field>`, if set
    pub fn setting(&self, field: &str) -> Result<Option<String>, PipelineError> {
        let Some(raw) = self.run.env.get(&format!("settings.{}", field)) else {
            return Ok(None);
        };

        let value = expression::render(raw, &self.run.env).map_err(|e| {
            PipelineError::StepError(format!("settings.{}: {}", field, e))
        })?;
        Ok(Some(value).filter(|v| !v.trim().is_empty()))
    }
}

/// Result of a successful action
#[derive(Debug, Clone, Default)]
pub struct ActionOutcome {
    /// Output variables, merged into the run as `steps.<id>.outputs.*`
    pub outputs: HashMap<String, String>,

    /// Log text recorded as the step output
    pub log: String,

    /// Artifact produced, if any
    pub artifact: Option<Artifact>,

    /// Registry references pushed
    pub images: Vec<String>,
}

impl ActionOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, key: &str, value: impl Into<String>) -> Self {
        self.outputs.insert(key.to_string(), value.into());
        self
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = log.into();
        self
    }
}

/// A reusable step implementation
#[async_trait]
pub trait Action: Send + Sync {
    /// Name steps use to reference the action
    fn name(&self) -> &str;

    /// Run the action
    async fn run(
        &self,
        inputs: &ActionInputs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, PipelineError>;
}

/// Actions available to steps, by name
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in action, publishing through `runtime`
    pub fn builtin(runtime: Arc<dyn ContainerRuntime>) -> Self {
        let runner = ProcessRunner::new();
        let publisher = ImagePublisher::new(runtime);

        Self::new()
            .with(Checkout::new(runner.clone()))
            .with(SetupToolchain::new(runner.clone()))
            .with(ArtifactBuilder::new(runner))
            .with(RegistryLogin::new(publisher.clone()))
            .with(ImageBuild::new(publisher.clone()))
            .with(ImagePush::new(publisher.clone()))
            .with(ImageMetadata)
            .with(PublishImage::new(publisher))
    }

    /// Add an action, replacing any with the same name
    pub fn register(&mut self, action: Arc<dyn Action>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn with<A: Action + 'static>(mut self, action: A) -> Self {
        self.register(Arc::new(action));
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::core::Settings;

    #[test]
    fn test_builtin_registry_names() {
        let registry = ActionRegistry::builtin(Arc::new(RecordingRuntime::default()));
        assert_eq!(
            registry.names(),
            vec![
                "build-artifact",
                "checkout",
                "image-build",
                "image-metadata",
                "image-push",
                "publish-image",
                "registry-login",
                "setup-toolchain",
            ]
        );
        assert!(registry.contains("image-push"));
        assert!(registry.get("deploy").is_none());
    }

    #[test]
    fn test_inputs_treat_blank_as_unset() {
        let mut values = HashMap::new();
        values.insert("image".to_string(), "  ".to_string());
        values.insert("sha".to_string(), " abc ".to_string());
        let inputs = ActionInputs::new(values);

        assert_eq!(inputs.get("image"), None);
        assert_eq!(inputs.get("sha"), Some("abc"));
        let err = inputs.require("image-push", "image").unwrap_err();
        assert_eq!(err.kind(), "StepError");
    }

    #[test]
    fn test_setting_is_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let run = run_context(
            dir.path(),
            Settings {
                image: Some("ghcr.io/${{ event.repository }}".to_string()),
                ..Settings::default()
            },
        );
        let ctx = ActionContext::new("push", &run);

        assert_eq!(ctx.setting("image").unwrap().as_deref(), Some("ghcr.io/Acme/Shop"));
        assert_eq!(ctx.setting("registry").unwrap(), None);

        let inputs = ActionInputs::default();
        assert_eq!(
            inputs.or_setting("image", &ctx, "image").unwrap().as_deref(),
            Some("ghcr.io/Acme/Shop")
        );
    }
}
