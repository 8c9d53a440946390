//! `build-artifact`: run the build tool and locate what it produced

use crate::actions::{Action, ActionContext, ActionInputs, ActionOutcome};
use crate::core::{Artifact, PipelineError};
use crate::runtime::{CommandSpec, ProcessOutput, ProcessRunner, DEFAULT_TAIL_LINES};
use async_trait::async_trait;
use glob::{MatchOptions, Pattern};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const NAME: &str = "build-artifact";

/// Runs a build command in a source tree and resolves its single artifact
///
/// Inputs: `command` (default `settings.build_command`), `artifact` glob
/// (default `settings.artifact`), `path` (default the step's working
/// directory). Outputs: `artifact`, `tag`.
#[derive(Debug, Clone, Default)]
pub struct ArtifactBuilder {
    runner: ProcessRunner,
}

/// A finished build
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub artifact: Artifact,
    pub process: ProcessOutput,
}

impl ArtifactBuilder {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    /// Run `command` in `source_dir` and find the artifact matching
    /// `artifact_glob`, tagged with `sha`
    pub async fn build(
        &self,
        source_dir: &Path,
        command: &str,
        artifact_glob: &str,
        sha: &str,
        env: HashMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<BuildOutput, PipelineError> {
        if !source_dir.is_dir() {
            return Err(PipelineError::BuildError(format!(
                "source directory {} does not exist",
                source_dir.display()
            )));
        }

        info!("Building in {}: {}", source_dir.display(), command);

        let spec = CommandSpec::shell("sh", command)
            .envs(env)
            .current_dir(source_dir)
            .timeout(timeout);

        let process = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| PipelineError::BuildError(format!("{}: {}", command, e)))?;

        if !process.success() {
            return Err(PipelineError::BuildError(format!(
                "{} {}:\n{}",
                command,
                process.status_line(),
                process.tail(DEFAULT_TAIL_LINES)
            )));
        }

        let path = locate_artifact(source_dir, artifact_glob)?;
        debug!("Artifact {}", path.display());

        Ok(BuildOutput {
            artifact: Artifact {
                path,
                tag: sha.to_string(),
            },
            process,
        })
    }
}

/// Resolve `pattern` under `source_dir` to exactly one path
pub fn locate_artifact(source_dir: &Path, pattern: &str) -> Result<PathBuf, PipelineError> {
    let base = Pattern::escape(&source_dir.display().to_string());
    let full = format!("{}/{}", base.trim_end_matches('/'), pattern.trim_start_matches("./"));

    let options = MatchOptions {
        require_literal_separator: true,
        ..MatchOptions::new()
    };
    let matches: Vec<PathBuf> = glob::glob_with(&full, options)
        .map_err(|e| {
            PipelineError::BuildError(format!("invalid artifact pattern '{}': {}", pattern, e))
        })?
        .filter_map(Result::ok)
        .collect();

    match matches.as_slice() {
        [single] => Ok(single.clone()),
        [] => Err(PipelineError::BuildError(format!(
            "no artifact matching '{}' in {}",
            pattern,
            source_dir.display()
        ))),
        several => Err(PipelineError::BuildError(format!(
            "{} artifacts match '{}': {}",
            several.len(),
            pattern,
            several
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

#[async_trait]
impl Action for ArtifactBuilder {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(
        &self,
        inputs: &ActionInputs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, PipelineError> {
        let command = inputs
            .or_setting("command", ctx, "build_command")?
            .ok_or_else(|| PipelineError::StepError(format!("{}: no build command", NAME)))?;
        let pattern = inputs
            .or_setting("artifact", ctx, "artifact")?
            .ok_or_else(|| PipelineError::StepError(format!("{}: no artifact pattern", NAME)))?;
        let source_dir = match inputs.get("path") {
            Some(path) => ctx.resolve_path(path),
            None => ctx.working_dir.clone(),
        };

        let output = self
            .build(&source_dir, &command, &pattern, ctx.sha(), ctx.env.clone(), ctx.timeout)
            .await?;

        let path = output.artifact.path.display().to_string();
        Ok(ActionOutcome {
            outputs: HashMap::from([
                ("artifact".to_string(), path),
                ("tag".to_string(), output.artifact.tag.clone()),
            ]),
            log: output.process.combined(),
            artifact: Some(output.artifact),
            images: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::run_context;
    use crate::core::Settings;

    fn source_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("target/classes")).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_build_finds_single_artifact() {
        let dir = source_tree();
        let output = ArtifactBuilder::default()
            .build(
                dir.path(),
                "echo compiled; touch target/app-1.0.jar",
                "target/*.jar",
                "abc123",
                HashMap::new(),
                None,
            )
            .await
            .unwrap();

        assert_eq!(output.artifact.path, dir.path().join("target/app-1.0.jar"));
        assert_eq!(output.artifact.tag, "abc123");
        assert_eq!(output.process.stdout.trim(), "compiled");
    }

    #[tokio::test]
    async fn test_failing_build_is_build_error() {
        let dir = source_tree();
        let err = ArtifactBuilder::default()
            .build(
                dir.path(),
                "echo 'cannot find symbol' >&2; exit 1",
                "target/*.jar",
                "abc123",
                HashMap::new(),
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), "BuildError");
        assert!(err.message().contains("cannot find symbol"));
    }

    #[tokio::test]
    async fn test_successful_build_without_artifact_is_build_error() {
        let dir = source_tree();
        let err = ArtifactBuilder::default()
            .build(dir.path(), "true", "target/*.jar", "abc123", HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(err.message().contains("no artifact matching"));
    }

    #[test]
    fn test_locate_artifact_rejects_several_matches() {
        let dir = source_tree();
        std::fs::write(dir.path().join("target/app.jar"), "").unwrap();
        std::fs::write(dir.path().join("target/app-plain.jar"), "").unwrap();

        let err = locate_artifact(dir.path(), "target/*.jar").unwrap_err();
        assert!(err.message().starts_with("2 artifacts match"));
    }

    #[test]
    fn test_locate_artifact_directory() {
        let dir = source_tree();
        std::fs::create_dir(dir.path().join("dist")).unwrap();
        assert_eq!(locate_artifact(dir.path(), "./dist").unwrap(), dir.path().join("dist"));
    }

    #[tokio::test]
    async fn test_action_uses_settings_defaults() {
        let dir = source_tree();
        let run = run_context(
            dir.path(),
            Settings {
                build_command: Some("mkdir -p dist && echo ok > dist/index.html".to_string()),
                artifact: Some("dist".to_string()),
                ..Settings::default()
            },
        );
        let ctx = ActionContext::new("build", &run);

        let outcome = ArtifactBuilder::default()
            .run(&ActionInputs::default(), &ctx)
            .await
            .unwrap();

        let artifact = outcome.artifact.unwrap();
        assert_eq!(artifact.path, dir.path().join("dist"));
        assert_eq!(artifact.tag, "abc123");
        assert_eq!(outcome.outputs.get("tag"), Some(&"abc123".to_string()));
        assert_eq!(
            outcome.outputs.get("artifact"),
            Some(&dir.path().join("dist").display().to_string())
        );
    }
}
