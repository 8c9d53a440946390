//! Step executor - runs a run's steps in order

use crate::{
    actions::{ActionContext, ActionInputs, ActionRegistry},
    core::{expression, Artifact, PipelineError, RunContext, Step, StepKind, StepResult},
    execution::ExecutionEvent,
    runtime::{CommandSpec, ProcessError, ProcessRunner},
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Env var naming the file shell steps write `key=value` outputs to
pub const OUTPUT_FILE_VAR: &str = "DOCKHAND_OUTPUT";

/// Result of executing a step
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    /// Step completed successfully
    Success {
        output: String,
        outputs: HashMap<String, String>,
        exit_code: Option<i32>,
        artifact: Option<Artifact>,
        images: Vec<String>,
    },
    /// Step failed
    Failed {
        output: String,
        exit_code: Option<i32>,
        error: PipelineError,
    },
}

impl ExecutionResult {
    fn failed(error: PipelineError) -> Self {
        ExecutionResult::Failed {
            output: String::new(),
            exit_code: None,
            error,
        }
    }
}

/// Working directory and child environment of a step
struct StepEnvironment {
    working_dir: PathBuf,
    env: HashMap<String, String>,
}

/// Executes steps
pub struct StepExecutor {
    runner: ProcessRunner,
    actions: ActionRegistry,
}

impl StepExecutor {
    pub fn new(actions: ActionRegistry) -> Self {
        Self {
            runner: ProcessRunner::new(),
            actions,
        }
    }

    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// Run `steps` in order, recording each result in `ctx`
    ///
    /// Stops after the first failure of a step whose policy is `abort`;
    /// later steps are never started and leave no result.
    pub async fn run_steps(
        &self,
        steps: &[Step],
        ctx: &mut RunContext,
        emit: &(dyn Fn(ExecutionEvent) + Send + Sync),
    ) {
        let total = steps.len();

        for (index, step) in steps.iter().enumerate() {
            emit(ExecutionEvent::StepStarted {
                run_id: ctx.run_id,
                step_id: step.id.clone(),
                name: step.name.clone(),
                index,
                total,
            });

            let started_at = Utc::now();
            let result = self.execute(step, ctx).await;
            let step_result = record_artifacts(step, ctx, result, started_at);
            let aborts = step_result.aborts_run();

            emit(ExecutionEvent::StepFinished {
                run_id: ctx.run_id,
                result: step_result.clone(),
            });
            ctx.record(step_result);

            if aborts {
                warn!(
                    "Step {} failed, skipping {} remaining step(s)",
                    step.id,
                    total - index - 1
                );
                break;
            }
        }
    }

    /// Execute a step and return the result
    pub async fn execute(&self, step: &Step, ctx: &RunContext) -> ExecutionResult {
        info!("Executing step: {} ({})", step.id, step.describe());

        let result = match &step.kind {
            StepKind::Shell { run, shell } => self.execute_shell(step, run, shell, ctx).await,
            StepKind::Action { uses } => self.execute_action(step, uses, ctx).await,
        };

        match &result {
            ExecutionResult::Success { .. } => info!("Step {} completed successfully", step.id),
            ExecutionResult::Failed { error, .. } => {
                error!("Step {} failed: {}", step.id, ctx.mask(&error.to_string()))
            }
        }
        result
    }

    async fn execute_shell(
        &self,
        step: &Step,
        script: &str,
        shell: &str,
        ctx: &RunContext,
    ) -> ExecutionResult {
        let environment = match prepare(step, ctx) {
            Ok(environment) => environment,
            Err(e) => return ExecutionResult::failed(e),
        };
        let command = match expression::render(script, &ctx.env) {
            Ok(command) => command,
            Err(e) => return ExecutionResult::failed(PipelineError::StepError(e.to_string())),
        };
        debug!("Command for step {}: {}", step.id, ctx.mask(&command));

        let output_file = output_file_path(ctx.run_id, &step.id);
        if let Err(e) = tokio::fs::write(&output_file, "").await {
            return ExecutionResult::failed(PipelineError::StepError(format!(
                "cannot create output file {}: {}",
                output_file.display(),
                e
            )));
        }

        let mut env = environment.env;
        env.insert(OUTPUT_FILE_VAR.to_string(), output_file.display().to_string());

        let spec = CommandSpec::shell(shell, &command)
            .envs(env)
            .current_dir(environment.working_dir)
            .timeout(step.timeout());
        let result = self.runner.run(&spec).await;

        let outputs = read_outputs(&output_file).await;
        if let Err(e) = tokio::fs::remove_file(&output_file).await {
            debug!("Could not remove {}: {}", output_file.display(), e);
        }

        match result {
            Ok(output) if output.success() => ExecutionResult::Success {
                output: output.combined(),
                outputs,
                exit_code: output.exit_code,
                artifact: None,
                images: Vec::new(),
            },
            Ok(output) => ExecutionResult::Failed {
                output: output.combined(),
                exit_code: output.exit_code,
                error: PipelineError::StepError(format!(
                    "{} {}",
                    step.describe(),
                    output.status_line()
                )),
            },
            Err(ProcessError::Timeout { limit, output }) => ExecutionResult::Failed {
                output: output.combined(),
                exit_code: None,
                error: PipelineError::StepError(format!("timed out after {:?}", limit)),
            },
            Err(e) => ExecutionResult::failed(PipelineError::StepError(e.to_string())),
        }
    }

    async fn execute_action(&self, step: &Step, uses: &str, ctx: &RunContext) -> ExecutionResult {
        let Some(action) = self.actions.get(uses) else {
            return ExecutionResult::failed(PipelineError::StepError(format!(
                "unknown action '{}'",
                uses
            )));
        };

        let environment = match prepare(step, ctx) {
            Ok(environment) => environment,
            Err(e) => return ExecutionResult::failed(e),
        };
        let inputs = match step.resolve_inputs(&ctx.env) {
            Ok(inputs) => ActionInputs::from(inputs),
            Err(e) => return ExecutionResult::failed(PipelineError::StepError(e.to_string())),
        };

        let action_ctx = ActionContext {
            step_id: &step.id,
            run: ctx,
            working_dir: environment.working_dir,
            env: environment.env,
            timeout: step.timeout(),
        };

        let fut = action.run(&inputs, &action_ctx);
        let result = match step.timeout() {
            Some(limit) => match timeout(limit, fut).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::StepError(format!(
                    "timed out after {:?}",
                    limit
                ))),
            },
            None => fut.await,
        };

        match result {
            Ok(outcome) => ExecutionResult::Success {
                output: outcome.log,
                outputs: outcome.outputs,
                exit_code: None,
                artifact: outcome.artifact,
                images: outcome.images,
            },
            Err(error) => ExecutionResult::failed(error),
        }
    }
}

/// Resolve the step's working directory and child environment
fn prepare(step: &Step, ctx: &RunContext) -> Result<StepEnvironment, PipelineError> {
    let step_env = step
        .resolve_env(&ctx.env)
        .map_err(|e| PipelineError::StepError(e.to_string()))?;

    let working_dir = match &step.working_directory {
        Some(dir) => {
            let dir = expression::render(dir, &ctx.env)
                .map_err(|e| PipelineError::StepError(e.to_string()))?;
            ctx.resolve_path(&dir)
        }
        None => ctx.workspace.clone(),
    };

    if !working_dir.is_dir() {
        return Err(PipelineError::StepError(format!(
            "working directory {} does not exist",
            working_dir.display()
        )));
    }

    let mut env = ctx.exported_env();
    env.extend(step_env);
    Ok(StepEnvironment { working_dir, env })
}

/// Turn an execution result into a masked StepResult, keeping any artifact
/// and pushed references on the run
fn record_artifacts(
    step: &Step,
    ctx: &mut RunContext,
    result: ExecutionResult,
    started_at: DateTime<Utc>,
) -> StepResult {
    let (success, output, outputs, exit_code, error) = match result {
        ExecutionResult::Success {
            output,
            outputs,
            exit_code,
            artifact,
            images,
        } => {
            if artifact.is_some() {
                ctx.artifact = artifact;
            }
            ctx.images.extend(images);
            (true, output, outputs, exit_code, None)
        }
        ExecutionResult::Failed {
            output,
            exit_code,
            error,
        } => (false, output, HashMap::new(), exit_code, Some(error)),
    };

    StepResult {
        step_id: step.id.clone(),
        name: step.name.clone(),
        started_at,
        completed_at: Utc::now(),
        exit_code,
        success,
        policy: step.failure_policy,
        output: ctx.mask(&output),
        outputs: outputs
            .into_iter()
            .map(|(k, v)| (k, ctx.mask(&v)))
            .collect(),
        error: error.map(|e| e.map_message(|m| ctx.mask(m))),
    }
}

fn output_file_path(run_id: Uuid, step_id: &str) -> PathBuf {
    std::env::temp_dir().join(format!("dockhand-{}-{}.out", run_id, step_id))
}

async fn read_outputs(path: &Path) -> HashMap<String, String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_outputs(&content),
        Err(e) => {
            debug!("No outputs read from {}: {}", path.display(), e);
            HashMap::new()
        }
    }
}

/// Parse `key=value` lines; blank lines, comments and lines without `=`
/// are skipped, and a repeated key keeps its last value
pub fn parse_outputs(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .collect()
}
