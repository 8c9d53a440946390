//! Container engine driven through its command-line client

use crate::core::PipelineError;
use crate::runtime::process::{CommandSpec, ProcessOutput, ProcessRunner, DEFAULT_TAIL_LINES};
use crate::runtime::{ContainerRuntime, ImageBuildRequest, RuntimeConfig};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// [`ContainerRuntime`] backed by a Docker-compatible CLI (`docker`, `podman`)
#[derive(Debug, Clone)]
pub struct DockerCli {
    program: String,
    timeout: Option<Duration>,
    runner: ProcessRunner,
}

impl DockerCli {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            program: config.program.unwrap_or_else(|| "docker".to_string()),
            timeout: config.timeout_secs.map(Duration::from_secs),
            runner: ProcessRunner::new(),
        }
    }

    /// Get the CLI program name
    pub fn program(&self) -> &str {
        &self.program
    }

    fn command(&self) -> CommandSpec {
        CommandSpec::new(&self.program).timeout(self.timeout)
    }

    /// Build the `build` invocation for a request
    pub fn build_command(&self, request: &ImageBuildRequest) -> CommandSpec {
        let mut spec = self.command().args(["build", "--quiet"]);

        if let Some(recipe) = &request.recipe {
            spec = spec.arg("--file").arg(recipe.display().to_string());
        }
        if let Some(target) = &request.target {
            spec = spec.arg("--target").arg(target);
        }
        for (key, value) in &request.build_args {
            spec = spec.arg("--build-arg").arg(format!("{}={}", key, value));
        }
        for (key, value) in &request.labels {
            spec = spec.arg("--label").arg(format!("{}={}", key, value));
        }

        spec.arg(request.context.display().to_string())
    }

    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput, String> {
        let subcommand = spec.args.first().map(String::as_str).unwrap_or_default();
        self.runner
            .run(spec)
            .await
            .map_err(|e| format!("{} {}: {}", self.program, subcommand, e))
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn login(&self, registry: &str, username: &str, token: &str) -> Result<(), PipelineError> {
        info!("Logging in to {} as {}", registry, username);

        let spec = self
            .command()
            .args(["login", registry, "--username", username, "--password-stdin"])
            .stdin(token);

        let output = self.run(&spec).await.map_err(PipelineError::AuthError)?;
        if !output.success() {
            return Err(PipelineError::AuthError(format!(
                "login to {} {}: {}",
                registry,
                output.status_line(),
                output.tail(DEFAULT_TAIL_LINES).replace(token, "***")
            )));
        }
        Ok(())
    }

    async fn build(&self, request: &ImageBuildRequest) -> Result<String, PipelineError> {
        info!("Building image from {}", request.context.display());

        let spec = self.build_command(request);
        let output = self.run(&spec).await.map_err(PipelineError::PublishError)?;
        if !output.success() {
            return Err(PipelineError::PublishError(format!(
                "image build {}: {}",
                output.status_line(),
                output.tail(DEFAULT_TAIL_LINES)
            )));
        }

        // `--quiet` prints only the image id
        let image_id = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .map(str::to_string)
            .ok_or_else(|| {
                PipelineError::PublishError("image build printed no image id".to_string())
            })?;

        debug!("Built image {}", image_id);
        Ok(image_id)
    }

    async fn tag(&self, image_id: &str, reference: &str) -> Result<(), PipelineError> {
        debug!("Tagging {} as {}", image_id, reference);

        let spec = self.command().args(["tag", image_id, reference]);
        let output = self.run(&spec).await.map_err(PipelineError::PublishError)?;
        if !output.success() {
            return Err(PipelineError::PublishError(format!(
                "tag {} {}: {}",
                reference,
                output.status_line(),
                output.tail(DEFAULT_TAIL_LINES)
            )));
        }
        Ok(())
    }

    async fn push(&self, reference: &str) -> Result<(), PipelineError> {
        info!("Pushing {}", reference);

        let spec = self.command().args(["push", reference]);
        let output = self.run(&spec).await.map_err(PipelineError::PublishError)?;
        if !output.success() {
            return Err(PipelineError::PublishError(format!(
                "push {} {}: {}",
                reference,
                output.status_line(),
                output.tail(DEFAULT_TAIL_LINES)
            )));
        }
        Ok(())
    }
}
