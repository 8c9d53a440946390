use anyhow::{Context, Result};
use dockhand::actions::ActionRegistry;
use dockhand::cli::commands::{HistoryCommand, ListCommand, RunCommand, ValidateCommand};
use dockhand::cli::output::*;
use dockhand::cli::{Cli, Command};
use dockhand::core::{ExecutionStatus, Pipeline, PipelineConfig};
use dockhand::execution::{ExecutionEngine, ExecutionEvent, RunOutcome, RunRequest};
use dockhand::persistence::{create_summary, ExecutionSummary, InMemoryPersistence, PersistenceBackend};
use dockhand::runtime::{DockerCli, RuntimeConfig};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Lines of step output shown with --show-output
const SHOWN_OUTPUT_LINES: usize = 20;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.as_str()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    let ok = match &cli.command {
        Command::Run(cmd) => run_pipelines(cmd, &cli).await?,
        Command::Validate(cmd) => validate_pipeline(cmd)?,
        Command::List(cmd) => list_pipelines(cmd, cli.db.as_deref()).await?,
        Command::History(cmd) => show_history(cmd, cli.db.as_deref()).await?,
    };

    if !ok {
        std::process::exit(1);
    }
    Ok(())
}

/// History store: the sqlite database when built with it, memory otherwise
async fn open_store(db: Option<&Path>) -> Result<Arc<dyn PersistenceBackend>> {
    #[cfg(feature = "sqlite")]
    {
        use dockhand::persistence::SqliteExecutionStore;
        let store = match db {
            Some(path) => SqliteExecutionStore::open(path).await?,
            None => SqliteExecutionStore::with_default_path().await?,
        };
        Ok(Arc::new(store))
    }

    #[cfg(not(feature = "sqlite"))]
    {
        if let Some(path) = db {
            tracing::warn!("Built without sqlite; ignoring --db {}", path.display());
        }
        Ok(Arc::new(InMemoryPersistence::new()))
    }
}

async fn run_pipelines(cmd: &RunCommand, cli: &Cli) -> Result<bool> {
    let event = cmd.event()?;

    let mut pipelines = Vec::with_capacity(cmd.file.len());
    for file in &cmd.file {
        let config = PipelineConfig::from_file(file).context("Failed to load pipeline config")?;
        println!("{} Loaded pipeline: {}", INFO, style(&config.name).bold());
        pipelines.push(Arc::new(config.to_pipeline()));
    }

    let variables: HashMap<String, String> = cmd.variable.iter().cloned().collect();
    for key in variables.keys() {
        println!("{} Variable override: {}", INFO, style(key).cyan());
    }

    let workspace = std::fs::canonicalize(&cmd.workspace)
        .with_context(|| format!("Workspace {} does not exist", cmd.workspace.display()))?;

    let requests: Vec<RunRequest> = pipelines
        .iter()
        .map(|pipeline| {
            RunRequest::new(Arc::clone(pipeline), event.clone(), workspace.clone())
                .with_credentials(cmd.credentials())
                .with_variables(variables.clone())
        })
        .collect();

    let store: Arc<dyn PersistenceBackend> = if cmd.no_history {
        Arc::new(InMemoryPersistence::new())
    } else {
        open_store(cli.db.as_deref()).await?
    };

    let runtime = DockerCli::new(RuntimeConfig::new().with_program(&cmd.container_cli));
    let actions = ActionRegistry::builtin(Arc::new(runtime));
    debug!("Registered actions: {:?}", actions.names());

    let triggered_steps: usize = pipelines
        .iter()
        .filter(|p| p.is_triggered_by(&event))
        .map(|p| p.steps.len())
        .sum();
    let progress = create_progress_bar(triggered_steps);

    let show_output = cli.show_output;
    let bar = progress.clone();
    let engine = ExecutionEngine::new(actions).with_event_handler(move |event| {
        bar.println(format_execution_event(&event));
        if let ExecutionEvent::StepFinished { result, .. } = &event {
            bar.inc(1);
            if show_output && !result.output.trim().is_empty() {
                bar.println(format_output(result.output.trim_end(), SHOWN_OUTPUT_LINES));
            }
        }
    });

    println!();
    let outcomes = engine.run_all(&requests).await;
    progress.finish_and_clear();

    let mut all_ok = true;
    for outcome in &outcomes {
        all_ok &= outcome.is_success();
        report_outcome(outcome, &pipelines);

        if let (RunOutcome::Finished(ctx), false) = (outcome, cmd.no_history) {
            let summary = create_summary(ctx);
            store.save_execution(&summary).await?;
            println!(
                "  {} saved to history (ID: {})",
                style(&summary.pipeline_name).dim(),
                style(&summary.execution_id.to_string()[..8]).dim()
            );
        }
    }

    Ok(all_ok)
}

fn report_outcome(outcome: &RunOutcome, pipelines: &[Arc<Pipeline>]) {
    let ctx = match outcome {
        RunOutcome::NotTriggered { pipeline_name } => {
            println!(
                "\n{} {} {}",
                INFO,
                style(pipeline_name).bold(),
                style("not triggered").dim()
            );
            return;
        }
        RunOutcome::Finished(ctx) => ctx,
    };

    if ctx.status == ExecutionStatus::Succeeded {
        println!(
            "\n{} {} completed {}",
            CHECK,
            style(&ctx.pipeline_name).bold(),
            style("successfully").green()
        );
        if let Some(artifact) = &ctx.artifact {
            println!("  Artifact: {}", style(artifact.path.display()).cyan());
        }
        for image in &ctx.images {
            println!("  Pushed: {}", style(image).cyan());
        }
        return;
    }

    println!(
        "\n{} {} {}",
        CROSS,
        style(&ctx.pipeline_name).bold(),
        style("failed").red()
    );
    if let Some(failed) = ctx.aborting_result() {
        println!("  {}", format_step_result(failed));
        if let Some(err) = &failed.error {
            error!("{}: {}", failed.step_id, err);
        }

        // Steps the abort skipped
        let skipped = pipelines
            .iter()
            .find(|p| p.name == ctx.pipeline_name)
            .and_then(|p| p.position(&failed.step_id).map(|i| p.steps.len() - i - 1))
            .unwrap_or(0);
        if skipped > 0 {
            println!("  {} {} later steps not run", WARN, skipped);
        }
    }
}

fn validate_pipeline(cmd: &ValidateCommand) -> Result<bool> {
    println!("{} Validating pipeline...", INFO);

    let config = match PipelineConfig::from_file(&cmd.file) {
        Ok(config) => config,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            return Ok(false);
        }
    };

    let registry = ActionRegistry::builtin(Arc::new(DockerCli::default()));
    let unknown: Vec<&str> = config
        .action_refs()
        .into_iter()
        .filter(|uses| !registry.contains(uses))
        .collect();
    if !unknown.is_empty() {
        println!("{} Validation failed:", CROSS);
        for uses in unknown {
            println!("  {}", style(format!("unknown action '{}'", uses)).red());
        }
        println!("  Known actions: {}", registry.names().join(", "));
        return Ok(false);
    }

    println!("{} Pipeline configuration is valid!", CHECK);
    println!("  Name: {}", style(&config.name).bold());
    println!("  Steps: {}", style(config.steps.len()).cyan());
    println!("  Variables: {}", style(config.env_as_string_map().len()).cyan());

    if cmd.json {
        let json = serde_json::to_string_pretty(&config)?;
        println!("\n{}", json);
    }
    Ok(true)
}

async fn list_pipelines(cmd: &ListCommand, db: Option<&Path>) -> Result<bool> {
    let store = open_store(db).await?;
    let pipelines = store.list_pipelines().await?;

    if cmd.json {
        let mut json_data = Vec::new();
        for pipeline in &pipelines {
            let executions = store.list_executions(pipeline).await?;
            json_data.push(serde_json::json!({
                "name": pipeline,
                "execution_count": executions.len(),
            }));
        }
        let data = serde_json::json!({ "pipelines": json_data });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    if pipelines.is_empty() {
        println!("{} No pipelines found in history", INFO);
        return Ok(true);
    }

    println!("{} Pipelines in history:", INFO);
    for pipeline_name in &pipelines {
        if cmd.with_counts {
            let executions = store.list_executions(pipeline_name).await?;
            let succeeded = executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Succeeded)
                .count();
            let failed = executions
                .iter()
                .filter(|e| e.status == ExecutionStatus::Failed)
                .count();
            println!(
                "  {} ({} runs: {} succeeded, {} failed)",
                style(pipeline_name).bold(),
                style(executions.len()).cyan(),
                style(succeeded).green(),
                style(failed).red()
            );
        } else {
            println!("  {}", style(pipeline_name).bold());
        }
    }

    Ok(true)
}

async fn show_history(cmd: &HistoryCommand, db: Option<&Path>) -> Result<bool> {
    let store = open_store(db).await?;

    if let Some(exec_id_str) = &cmd.execution_id {
        let exec_id =
            uuid::Uuid::parse_str(exec_id_str).context("Invalid execution ID format")?;
        return match store.load_execution(exec_id).await? {
            Some(summary) => {
                if cmd.json {
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                } else {
                    print_execution_details(&summary, cmd.details);
                }
                Ok(true)
            }
            None => {
                println!("{} Execution not found", WARN);
                Ok(false)
            }
        };
    }

    let mut executions = match &cmd.pipeline {
        Some(pipeline_name) => store.list_executions(pipeline_name).await?,
        None => {
            let mut all_execs = Vec::new();
            for pipeline in store.list_pipelines().await? {
                all_execs.extend(store.list_executions(&pipeline).await?);
            }
            all_execs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
            all_execs
        }
    };
    executions.truncate(cmd.limit);

    if cmd.json {
        let data = serde_json::json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(true);
    }

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(true);
    }

    println!("{} Execution history (showing latest {}):", INFO, cmd.limit);
    for summary in &executions {
        println!("  {}", format_execution_summary(summary));
        if cmd.details {
            for step in &summary.steps {
                println!("      {}", format_step_result(step));
            }
        }
    }

    Ok(true)
}

fn print_execution_details(summary: &ExecutionSummary, details: bool) {
    println!("{} Execution Details", INFO);
    println!("  ID: {}", style(summary.execution_id).cyan());
    println!("  Pipeline: {}", style(&summary.pipeline_name).bold());
    println!("  Status: {}", format_status(summary.status));
    println!(
        "  Event: {} {} @ {}",
        summary.event.kind.as_str(),
        summary.event.git_ref,
        style(&summary.event.sha).dim()
    );
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
    }
    if let Some(duration) = summary.duration() {
        println!("  Duration: {}", style(format_duration(duration)).dim());
    }
    println!(
        "  Progress: {} ({}/{})",
        style(format!("{:.0}%", summary.progress * 100.0)).cyan(),
        summary.completed_steps,
        summary.total_steps
    );
    if let Some(artifact) = &summary.artifact {
        println!("  Artifact: {}", style(artifact.path.display()).cyan());
    }
    for image in &summary.images {
        println!("  Image: {}", style(image).cyan());
    }
    if let Some(failure) = &summary.failure {
        println!(
            "  Failure: {} {}",
            style(failure.kind()).red().bold(),
            failure.message()
        );
    }

    if details {
        println!("\n  {}", style("Steps:").bold());
        for step in &summary.steps {
            println!("    {}", format_step_result(step));
            if !step.output.trim().is_empty() {
                for line in format_output(step.output.trim_end(), SHOWN_OUTPUT_LINES).lines() {
                    println!("      {}", style(line).dim());
                }
            }
        }
    }
}
