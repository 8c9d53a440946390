//! `checkout`: make the source tree at the triggering commit available

use crate::actions::{Action, ActionContext, ActionInputs, ActionOutcome};
use crate::core::PipelineError;
use crate::runtime::{CommandSpec, ProcessRunner};
use async_trait::async_trait;
use std::path::Path;
use tracing::info;

const NAME: &str = "checkout";

/// Clones a repository at a commit, or checks that the workspace already
/// holds the sources
///
/// Inputs: `path` (default `.`), `repository` (URL or `owner/repo`),
/// `ref` (default the event SHA), `server` (default `https://github.com`).
/// Outputs: `path`, `sha`.
#[derive(Debug, Clone, Default)]
pub struct Checkout {
    runner: ProcessRunner,
}

impl Checkout {
    pub fn new(runner: ProcessRunner) -> Self {
        Self { runner }
    }

    async fn git(&self, ctx: &ActionContext<'_>, args: &[&str]) -> Result<String, PipelineError> {
        let command = args.join(" ");
        let spec = CommandSpec::new("git")
            .args(args.iter().copied())
            .envs(ctx.env.clone())
            .current_dir(ctx.working_dir.clone())
            .timeout(ctx.timeout);

        let output = self
            .runner
            .run(&spec)
            .await
            .map_err(|e| PipelineError::StepError(format!("{}: git {}: {}", NAME, command, e)))?;

        if !output.success() {
            return Err(PipelineError::StepError(format!(
                "{}: git {} {}: {}",
                NAME,
                command,
                output.status_line(),
                output.tail(10)
            )));
        }
        Ok(output.stdout)
    }
}

/// Expand `owner/repo` to a clone URL; URLs and local paths pass through
pub fn clone_url(repository: &str, server: &str) -> String {
    let is_shorthand = !repository.contains("://")
        && !repository.starts_with("git@")
        && !repository.starts_with('/')
        && !repository.starts_with('.')
        && repository.matches('/').count() == 1;

    if is_shorthand {
        format!("{}/{}.git", server.trim_end_matches('/'), repository)
    } else {
        repository.to_string()
    }
}

#[async_trait]
impl Action for Checkout {
    fn name(&self) -> &str {
        NAME
    }

    async fn run(
        &self,
        inputs: &ActionInputs,
        ctx: &ActionContext<'_>,
    ) -> Result<ActionOutcome, PipelineError> {
        let target = ctx.resolve_path(inputs.get("path").unwrap_or("."));
        let target_str = target.display().to_string();
        let git_ref = inputs.get("ref").unwrap_or(ctx.sha()).to_string();
        let mut log = Vec::new();

        if let Some(repository) = inputs.get("repository") {
            let url = clone_url(repository, inputs.get("server").unwrap_or("https://github.com"));

            if !target.join(".git").exists() {
                info!("Cloning {} into {}", url, target_str);
                self.git(ctx, &["clone", "--quiet", url.as_str(), target_str.as_str()]).await?;
                log.push(format!("Cloned {}", url));
            }

            // The requested ref need not exist as a local branch
            info!("Fetching {} {} into {}", url, git_ref, target_str);
            let fetch_args = [
                "-C",
                target_str.as_str(),
                "fetch",
                "--quiet",
                url.as_str(),
                git_ref.as_str(),
            ];
            self.git(ctx, &fetch_args).await?;
            log.push(format!("Fetched {} from {}", git_ref, url));

            let checkout_args = [
                "-C",
                target_str.as_str(),
                "checkout",
                "--quiet",
                "--detach",
                "FETCH_HEAD",
            ];
            self.git(ctx, &checkout_args).await?;
        } else if !target.is_dir() {
            return Err(PipelineError::StepError(format!(
                "{}: source directory {} does not exist",
                NAME, target_str
            )));
        }

        let sha = if is_git_tree(&target) {
            self.git(ctx, &["-C", target_str.as_str(), "rev-parse", "HEAD"])
                .await?
                .trim()
                .to_string()
        } else {
            git_ref
        };

        log.push(format!("Sources at {} ({})", target_str, sha));

        Ok(ActionOutcome::new()
            .with_output("path", target_str)
            .with_output("sha", sha)
            .with_log(log.join("\n")))
    }
}

fn is_git_tree(path: &Path) -> bool {
    path.join(".git").exists()
}
