//! `setup-toolchain`: check that the requested language runtime is present

use crate::actions::{Action, ActionContext, ActionInputs, ActionOutcome};
use crate::core::PipelineError;
use crate::runtime::{CommandSpec, ProcessError, ProcessRunner};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tracing::info;

const NAME: &str = "setup-toolchain";

static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)*").expect("valid version regex"));

/// Probes a tool and checks its reported version
///
/// Inputs: `tool` (default `settings.runtime`), `version` (default
/// `settings.runtime_version`). Outputs: `tool`, `version`.
#[derive(Debug, Clone, Default)]
pub struct SetupToolchain {
    runner: ProcessRunner,
}

impl SetupToolchain {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }
}

/// Command that prints a tool's version
pub fn probe_command(tool: &str) -> (String, Vec<&'static str>) {
    match tool {
        "java" | "jdk" => ("java".to_string(), vec!["-version"]),
        "maven" | "mvn" => ("mvn".to_string(), vec!["-v"]),
        "go" => ("go".to_string(), vec!["version"]),
        "python" => ("python3".to_string(), vec!["--version"]),
        "node" | "nodejs" => ("node".to_string(), vec!["--version"]),
        other => (other.to_string(), vec!["--version"]),
    }
}

/// First version number in `reported`
pub fn extract_version(reported: &str) -> Option<&str> {
    VERSION_REGEX.find(reported).map(|m| m.as_str())
}

/// Whether any version number in `reported` is `requested` or a release of it
///
/// `17` matches `17.0.9`; `20.1` matches `20.1.3` but not `20.10.0`.
pub fn version_matches(reported: &str, requested: &str) -> bool {
    let requested = requested.trim().trim_start_matches('v');
    VERSION_REGEX.find_iter(reported).any(|m| {
        let found = m.as_str();
        found == requested || found.starts_with(&format!("{}.", requested))
    })
}

#[async_trait]
impl Action for SetupToolchain {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(
        &self,
        inputs: &ActionInputs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, PipelineError> {
        let tool = inputs
            .or_setting("tool", ctx, "runtime")?
            .ok_or_else(|| PipelineError::StepError(format!("{}: no tool given", NAME)))?;
        let requested = inputs.or_setting("version", ctx, "runtime_version")?;

        let (program, args) = probe_command(&tool);
        let spec = CommandSpec::new(&program)
            .args(args)
            .envs(ctx.env.clone())
            .current_dir(ctx.working_dir.clone())
            .timeout(ctx.timeout);

        let output = self.runner.run(&spec).await.map_err(|e| match e {
            ProcessError::Spawn { .. } => {
                PipelineError::StepError(format!("{}: {} is not installed", NAME, tool))
            }
            other => PipelineError::StepError(format!("{}: {}: {}", NAME, program, other)),
        })?;

        if !output.success() {
            return Err(PipelineError::StepError(format!(
                "{}: {} {}",
                NAME,
                program,
                output.status_line()
            )));
        }

        // `java -version` reports on stderr
        let combined = output.combined();
        let reported = combined
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .unwrap_or_default()
            .to_string();

        if let Some(requested) = &requested {
            if !version_matches(&reported, requested) {
                return Err(PipelineError::StepError(format!(
                    "{}: {} {} requested, found: {}",
                    NAME, tool, requested, reported
                )));
            }
        }

        let version = extract_version(&reported).unwrap_or(&reported).to_string();
        info!("Using {} {}", tool, version);

        Ok(ActionOutcome::new()
            .with_output("tool", tool.as_str())
            .with_output("version", version)
            .with_log(reported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::test_support::run_context;
    use crate::core::Settings;
    use std::collections::HashMap;

    #[test]
    fn test_version_matches() {
        assert!(version_matches(r#"openjdk version "17.0.9" 2023-10-17"#, "17"));
        assert!(version_matches("v20.11.0", "20"));
        assert!(version_matches("v20.11.0", "v20.11"));
        assert!(!version_matches("v20.11.0", "18"));
        assert!(!version_matches("20.10.0", "20.1"));
    }

    #[test]
    fn test_extract_version() {
        assert_eq!(extract_version("v20.11.0"), Some("20.11.0"));
        assert_eq!(extract_version("Apache Maven 3.9.6 (bc0240f3)"), Some("3.9.6"));
        assert_eq!(extract_version("no digits"), None);
    }

    #[test]
    fn test_probe_command() {
        assert_eq!(probe_command("java"), ("java".to_string(), vec!["-version"]));
        assert_eq!(probe_command("sh"), ("sh".to_string(), vec!["--version"]));
    }

    #[tokio::test]
    async fn test_missing_tool_fails() {
        let dir = tempfile::tempdir().unwrap();
        let run = run_context(dir.path(), Settings::default());
        let ctx = ActionContext::new("setup", &run);

        let mut values = HashMap::new();
        values.insert("tool".to_string(), "no-such-toolchain-9731".to_string());
        let err = SetupToolchain::default()
            .run(&ActionInputs::new(values), &ctx)
            .await
            .unwrap_err();
        assert!(err.message().contains("is not installed"));
    }

    #[tokio::test]
    async fn test_tool_defaults_from_settings() {
        let dir = tempfile::tempdir().unwrap();
        let run = run_context(dir.path(), Settings::default());
        let ctx = ActionContext::new("setup", &run);

        let err = SetupToolchain::default()
            .run(&ActionInputs::default(), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err, PipelineError::StepError("setup-toolchain: no tool given".to_string()));
    }
}
