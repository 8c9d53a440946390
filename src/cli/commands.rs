//! CLI command definitions

use crate::core::{Credentials, Event, EventKind};
use anyhow::{Context, Result};
use clap::Args;
use std::path::{Path, PathBuf};

/// Evaluate pipelines against an event and run the triggered ones
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Pipeline YAML file (repeat for several pipelines)
    #[arg(short, long, required = true)]
    pub file: Vec<PathBuf>,

    /// Event kind
    #[arg(long, value_enum, default_value_t = EventKindArg::Push)]
    pub event: EventKindArg,

    /// Target ref, `refs/heads/<branch>` or a branch name
    #[arg(long = "ref", env = "DOCKHAND_REF")]
    pub git_ref: Option<String>,

    /// Triggering commit SHA
    #[arg(long, env = "DOCKHAND_SHA")]
    pub sha: Option<String>,

    /// Repository as owner/repo
    #[arg(long, env = "DOCKHAND_REPOSITORY")]
    pub repository: Option<String>,

    /// Files changed by the push (for path filters)
    #[arg(long = "changed-path")]
    pub changed_paths: Vec<String>,

    /// Read the event from a JSON file (takes precedence over --ref/--sha)
    #[arg(long)]
    pub event_file: Option<PathBuf>,

    /// Variable overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub variable: Vec<(String, String)>,

    /// Directory steps run in
    #[arg(short, long, default_value = ".")]
    pub workspace: PathBuf,

    /// Registry token
    #[arg(long, env = "DOCKHAND_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Identity the token belongs to
    #[arg(long, env = "DOCKHAND_ACTOR")]
    pub actor: Option<String>,

    /// Container engine CLI used to build and push images
    #[arg(long, env = "DOCKHAND_CONTAINER_CLI", default_value = "docker")]
    pub container_cli: String,

    /// Don't save runs to history
    #[arg(long)]
    pub no_history: bool,
}

impl RunCommand {
    /// The event described by the flags or the event file
    pub fn event(&self) -> Result<Event> {
        let mut event = match &self.event_file {
            Some(path) => load_event_file(path)?,
            None => {
                let git_ref = self
                    .git_ref
                    .clone()
                    .context("--ref is required unless --event-file is given")?;
                let sha = self
                    .sha
                    .clone()
                    .context("--sha is required unless --event-file is given")?;
                match self.event.into() {
                    EventKind::Push => Event::push(git_ref, sha),
                    EventKind::Manual => Event::manual(git_ref, sha),
                }
            }
        };

        if let Some(repository) = &self.repository {
            event.repository = Some(repository.clone());
        }
        if !self.changed_paths.is_empty() {
            event.changed_paths = Some(self.changed_paths.clone());
        }

        if event.sha.trim().is_empty() {
            anyhow::bail!("Event has an empty commit SHA");
        }
        Ok(event)
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.token.clone(), self.actor.clone())
    }
}

/// Load an event from JSON: `{"kind": "push", "ref": "...", "sha": "..."}`
pub fn load_event_file(path: &Path) -> Result<Event> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read event file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Invalid event file {}", path.display()))
}

/// Validate a pipeline configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to pipeline YAML file
    #[arg(short, long)]
    pub file: PathBuf,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List pipelines with recorded runs
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show run counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Pipeline name to filter by
    #[arg(short, long)]
    pub pipeline: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show step-by-step details
    #[arg(long)]
    pub details: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,

    /// Show a specific run
    #[arg(long)]
    pub execution_id: Option<String>,
}

/// Event kind argument
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum EventKindArg {
    Push,
    Manual,
}

impl From<EventKindArg> for EventKind {
    fn from(arg: EventKindArg) -> Self {
        match arg {
            EventKindArg::Push => EventKind::Push,
            EventKindArg::Manual => EventKind::Manual,
        }
    }
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("Invalid key=value pair: {}", s)),
    }
}
