//! Process and container runtimes used by steps

pub mod container;
pub mod process;

use crate::core::PipelineError;
use async_trait::async_trait;
use std::path::PathBuf;

pub use container::DockerCli;
pub use process::{
    CommandSpec, ProcessError, ProcessOutput, ProcessRunner, DEFAULT_TAIL_LINES, TOKEN_ENV_VAR,
};

/// Configuration for the container runtime
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// CLI executable, defaults to `docker` (assumes it's on PATH)
    pub program: Option<String>,

    /// Timeout per CLI invocation in seconds
    pub timeout_secs: Option<u64>,
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = Some(program.into());
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = Some(timeout_secs);
        self
    }
}

/// Inputs to an image build
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageBuildRequest {
    /// Build context directory
    pub context: PathBuf,

    /// Image recipe (Dockerfile); the engine's default when unset
    pub recipe: Option<PathBuf>,

    pub build_args: Vec<(String, String)>,
    pub labels: Vec<(String, String)>,

    /// Multi-stage target
    pub target: Option<String>,
}

impl ImageBuildRequest {
    pub fn new(context: impl Into<PathBuf>) -> Self {
        Self {
            context: context.into(),
            ..Self::default()
        }
    }

    pub fn with_recipe(mut self, recipe: impl Into<PathBuf>) -> Self {
        self.recipe = Some(recipe.into());
        self
    }

    pub fn with_build_arg(mut self, key: &str, value: &str) -> Self {
        self.build_args.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.labels.push((key.to_string(), value.to_string()));
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn has_build_arg(&self, key: &str) -> bool {
        self.build_args.iter().any(|(k, _)| k == key)
    }
}

/// Trait for container engine access - allows for different implementations
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Authenticate against a registry; rejection is an `AuthError`
    async fn login(&self, registry: &str, username: &str, token: &str) -> Result<(), PipelineError>;

    /// Build an image and return its id
    async fn build(&self, request: &ImageBuildRequest) -> Result<String, PipelineError>;

    /// Add a reference to a built image
    async fn tag(&self, image_id: &str, reference: &str) -> Result<(), PipelineError>;

    /// Push a reference to its registry
    async fn push(&self, reference: &str) -> Result<(), PipelineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfig::new().with_program("podman").with_timeout(600);
        assert_eq!(config.program.as_deref(), Some("podman"));
        assert_eq!(config.timeout_secs, Some(600));
    }

    #[test]
    fn test_build_request_builder() {
        let request = ImageBuildRequest::new("frontend")
            .with_build_arg("PORT", "80")
            .with_label("org.opencontainers.image.revision", "abc123");
        assert!(request.has_build_arg("PORT"));
        assert!(!request.has_build_arg("ARTIFACT"));
        assert_eq!(request.labels.len(), 1);
        assert!(request.recipe.is_none());
    }
}
