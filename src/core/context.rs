//! Run context - one per triggered execution

use crate::core::{
    config::FailurePolicy,
    error::PipelineError,
    pipeline::Pipeline,
    state::ExecutionStatus,
    trigger::Event,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

const MASK: &str = "***";

/// Ambient credentials supplied by the hosting platform
///
/// Read-only inputs to a run; never generated or stored.
#[derive(Clone, Default)]
pub struct Credentials {
    /// Registry access token
    pub token: Option<String>,

    /// Identity the token belongs to
    pub actor: Option<String>,
}

impl Credentials {
    pub fn new(token: Option<String>, actor: Option<String>) -> Self {
        Self {
            token: token.filter(|t| !t.is_empty()),
            actor: actor.filter(|a| !a.is_empty()),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| MASK))
            .field("actor", &self.actor)
            .finish()
    }
}

/// A build output destined for packaging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// File or directory produced by the build tool
    pub path: PathBuf,

    /// Semantic tag, the triggering commit SHA
    pub tag: String,
}

/// Outcome of one executed step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,

    /// Exit code of the process, when one ran to completion
    pub exit_code: Option<i32>,

    pub success: bool,
    pub policy: FailurePolicy,

    /// Captured output with secrets masked
    pub output: String,

    /// Output variables the step declared
    #[serde(default)]
    pub outputs: HashMap<String, String>,

    #[serde(default)]
    pub error: Option<PipelineError>,
}

impl StepResult {
    /// Whether this result stops the run
    pub fn aborts_run(&self) -> bool {
        !self.success && self.policy == FailurePolicy::Abort
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at.signed_duration_since(self.started_at)
    }
}

/// Execution context for a pipeline run
///
/// Owns its environment and step log exclusively; nothing here is shared
/// between runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub event: Event,

    /// Expression environment: variables, settings, event fields,
    /// credentials and step outputs
    pub env: HashMap<String, String>,

    /// Step log, append-only, in execution order
    pub results: Vec<StepResult>,

    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Directory steps run in
    pub workspace: PathBuf,

    pub total_steps: usize,

    /// Artifact produced by the build, if any
    pub artifact: Option<Artifact>,

    /// Registry references pushed during the run
    pub images: Vec<String>,

    credentials: Credentials,
}

impl RunContext {
    /// Create a context for a run of `pipeline` triggered by `event`
    ///
    /// The environment is layered, later layers winning: pipeline env,
    /// variable overrides, `settings.*`, `event.*`, `secrets.token`, `run.*`.
    pub fn new(
        pipeline: &Pipeline,
        event: Event,
        credentials: Credentials,
        overrides: &HashMap<String, String>,
        workspace: &Path,
    ) -> Self {
        let run_id = Uuid::new_v4();
        let mut env = pipeline.env.clone();
        env.extend(overrides.clone());
        env.extend(pipeline.settings.to_env());

        env.insert("event.kind".to_string(), event.kind.as_str().to_string());
        env.insert("event.ref".to_string(), event.git_ref.clone());
        env.insert("event.sha".to_string(), event.sha.clone());
        if let Some(branch) = event.branch() {
            env.insert("event.branch".to_string(), branch.to_string());
        }
        if let Some(repository) = &event.repository {
            env.insert("event.repository".to_string(), repository.clone());
            if let Some((owner, repo)) = repository.split_once('/') {
                env.insert("event.owner".to_string(), owner.to_string());
                env.insert("event.repo".to_string(), repo.to_string());
            }
        }

        if let Some(token) = &credentials.token {
            env.insert("secrets.token".to_string(), token.clone());
        }
        if let Some(actor) = &credentials.actor {
            env.insert("run.actor".to_string(), actor.clone());
        }
        env.insert("run.id".to_string(), run_id.to_string());
        env.insert("run.workspace".to_string(), workspace.display().to_string());

        Self {
            run_id,
            pipeline_name: pipeline.name.clone(),
            event,
            env,
            results: Vec::new(),
            status: ExecutionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            workspace: workspace.to_path_buf(),
            total_steps: pipeline.steps.len(),
            artifact: None,
            images: Vec::new(),
            credentials,
        }
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Mark the run as started
    pub fn start(&mut self) {
        self.status = ExecutionStatus::Running;
        self.started_at = Utc::now();
    }

    /// Mark the run as succeeded
    pub fn succeed(&mut self) {
        self.status = ExecutionStatus::Succeeded;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the run as failed
    pub fn fail(&mut self) {
        self.status = ExecutionStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    /// Append a step result and merge its outputs into the environment
    pub fn record(&mut self, result: StepResult) {
        for (name, value) in &result.outputs {
            self.env.insert(
                format!("steps.{}.outputs.{}", result.step_id, name),
                value.clone(),
            );
        }
        let outcome = if result.success { "success" } else { "failure" };
        self.env
            .insert(format!("steps.{}.outcome", result.step_id), outcome.to_string());

        self.results.push(result);
    }

    /// Variables exported to child processes
    ///
    /// Only plain names are exported; dotted keys (settings, event fields,
    /// secrets, step outputs) stay expression-only.
    pub fn exported_env(&self) -> HashMap<String, String> {
        let mut exported: HashMap<String, String> = self
            .env
            .iter()
            .filter(|(k, _)| !k.contains('.'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        exported.insert("CI".to_string(), "true".to_string());
        exported.insert("DOCKHAND_RUN_ID".to_string(), self.run_id.to_string());
        exported.insert("DOCKHAND_PIPELINE".to_string(), self.pipeline_name.clone());
        exported.insert("DOCKHAND_EVENT".to_string(), self.event.kind.as_str().to_string());
        exported.insert("DOCKHAND_REF".to_string(), self.event.git_ref.clone());
        exported.insert("DOCKHAND_SHA".to_string(), self.event.sha.clone());
        exported.insert("DOCKHAND_WORKSPACE".to_string(), self.workspace.display().to_string());
        if let Some(actor) = &self.credentials.actor {
            exported.insert("DOCKHAND_ACTOR".to_string(), actor.clone());
        }
        exported
    }

    /// Replace secret values in `text`
    pub fn mask(&self, text: &str) -> String {
        match &self.credentials.token {
            Some(token) => text.replace(token.as_str(), MASK),
            None => text.to_string(),
        }
    }

    /// Resolve a path relative to the workspace
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.workspace.join(p)
        }
    }

    pub fn succeeded_steps(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn failed_steps(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    /// The failure that aborted the run, if any
    pub fn aborting_result(&self) -> Option<&StepResult> {
        self.results.iter().find(|r| r.aborts_run())
    }
}
