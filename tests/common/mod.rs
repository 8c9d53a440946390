//! Shared helpers for the scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use dockhand::actions::ActionRegistry;
use dockhand::core::{Credentials, Event, PipelineConfig, PipelineError, RunContext};
use dockhand::execution::{ExecutionEngine, RunOutcome, RunRequest};
use dockhand::runtime::{ContainerRuntime, ImageBuildRequest};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub const TOKEN: &str = "ghp_s3cr3t";
pub const ACTOR: &str = "octocat";

/// Container runtime that records every call instead of talking to an engine
#[derive(Default)]
pub struct MockContainerRuntime {
    calls: Mutex<Vec<String>>,
    reject_login: bool,
    fail_push: Option<String>,
}

impl MockContainerRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every login attempt fails with an authentication error
    pub fn rejecting_login() -> Self {
        Self {
            reject_login: true,
            ..Self::default()
        }
    }

    /// Pushing `reference` fails
    pub fn failing_push(reference: &str) -> Self {
        Self {
            fail_push: Some(reference.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose first word is `verb`
    pub fn calls_to(&self, verb: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.split_whitespace().next() == Some(verb))
            .collect()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ContainerRuntime for MockContainerRuntime {
    async fn login(&self, registry: &str, username: &str, token: &str) -> Result<(), PipelineError> {
        self.record(format!("login {} {}", registry, username));
        if self.reject_login || token != TOKEN {
            return Err(PipelineError::AuthError(format!(
                "login to {} as {} denied",
                registry, username
            )));
        }
        Ok(())
    }

    async fn build(&self, request: &ImageBuildRequest) -> Result<String, PipelineError> {
        let args: Vec<String> = request
            .build_args
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        self.record(format!("build {}", args.join(" ")));
        Ok("sha256:feedbeef".to_string())
    }

    async fn tag(&self, image_id: &str, reference: &str) -> Result<(), PipelineError> {
        self.record(format!("tag {} {}", image_id, reference));
        Ok(())
    }

    async fn push(&self, reference: &str) -> Result<(), PipelineError> {
        self.record(format!("push {}", reference));
        if self.fail_push.as_deref() == Some(reference) {
            return Err(PipelineError::PublishError(format!(
                "denied: {} rejected by registry",
                reference
            )));
        }
        Ok(())
    }
}

/// Engine with the built-in actions backed by `runtime`
pub fn engine(runtime: Arc<MockContainerRuntime>) -> ExecutionEngine {
    ExecutionEngine::new(ActionRegistry::builtin(runtime))
}

/// A scratch workspace; canonical so artifact paths compare cleanly
pub fn workspace() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().canonicalize().unwrap();
    (dir, path)
}

pub fn push_to(branch: &str) -> Event {
    Event::push(format!("refs/heads/{}", branch), "abc123").with_repository("Acme/Shop")
}

pub fn credentials() -> Credentials {
    Credentials::new(Some(TOKEN.to_string()), Some(ACTOR.to_string()))
}

/// Request for the pipeline in `yaml`, with valid credentials
pub fn request(yaml: &str, event: Event, workspace: &Path) -> RunRequest {
    let config = PipelineConfig::from_yaml(yaml).unwrap();
    RunRequest::new(Arc::new(config.to_pipeline()), event, workspace)
        .with_credentials(credentials())
}

pub fn finished(outcome: &RunOutcome) -> &RunContext {
    outcome.context().expect("pipeline was not triggered")
}

/// Ids of the recorded steps, in execution order
pub fn step_ids(ctx: &RunContext) -> Vec<&str> {
    ctx.results.iter().map(|r| r.step_id.as_str()).collect()
}

pub fn assert_step_failed_with(ctx: &RunContext, step_id: &str, kind: &str) {
    let result = ctx
        .results
        .iter()
        .find(|r| r.step_id == step_id)
        .unwrap_or_else(|| panic!("step '{}' did not run", step_id));
    assert!(!result.success, "step '{}' should have failed", step_id);
    let error = result.error.as_ref().expect("failed step has an error");
    assert_eq!(error.kind(), kind, "unexpected error for '{}': {}", step_id, error);
}

/// Check out, build the JAR, publish the image
pub const BACKEND: &str = r#"
name: backend
on:
  push:
    branches: [main]
    paths: ["backend/**"]
  manual: true

settings:
  runtime: java
  runtime_version: "17"
  build_command: "mkdir -p target && echo jar > target/shop-1.0.jar"
  artifact: "target/*.jar"
  port: 8080
  image: "ghcr.io/${{ event.repository }}-backend"

steps:
  - id: checkout
    uses: checkout
  - id: build
    uses: build-artifact
  - id: publish
    uses: publish-image
"#;

/// Built with a shell step that declares an output
pub const FRONTEND: &str = r#"
name: frontend
on:
  push:
    branches: [main]
    paths: ["frontend/**"]
  manual: true

settings:
  port: 80
  image: "ghcr.io/acme/shop-frontend"

steps:
  - id: build
    run: |
      mkdir -p dist
      echo "<html></html>" > dist/index.html
      echo "bundle=dist" >> "$DOCKHAND_OUTPUT"
  - id: publish
    uses: publish-image
    with:
      build-args: |
        BUNDLE=${{ steps.build.outputs.bundle }}
"#;
