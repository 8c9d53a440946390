//! Main execution engine - decides whether an event starts a run and
//! drives the run to a terminal status

use crate::{
    actions::ActionRegistry,
    core::{Credentials, Event, ExecutionStatus, Pipeline, RunContext, StepResult},
    execution::StepExecutor,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Events that can occur during pipeline execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// The event did not match the pipeline's trigger
    RunSkipped {
        pipeline_name: String,
        git_ref: String,
    },
    RunStarted {
        run_id: Uuid,
        pipeline_name: String,
        total_steps: usize,
    },
    StepStarted {
        run_id: Uuid,
        step_id: String,
        name: String,
        index: usize,
        total: usize,
    },
    StepFinished {
        run_id: Uuid,
        result: StepResult,
    },
    RunFinished {
        run_id: Uuid,
        pipeline_name: String,
        status: ExecutionStatus,
    },
}

/// Type for event handlers
pub type EventHandler = Arc<dyn Fn(ExecutionEvent) + Send + Sync>;

/// One pipeline to evaluate against one event
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub pipeline: Arc<Pipeline>,
    pub event: Event,
    pub credentials: Credentials,

    /// Variable overrides layered over the pipeline's `env`
    pub variables: HashMap<String, String>,

    /// Directory the run's steps execute in
    pub workspace: PathBuf,
}

impl RunRequest {
    pub fn new(pipeline: Arc<Pipeline>, event: Event, workspace: impl Into<PathBuf>) -> Self {
        Self {
            pipeline,
            event,
            credentials: Credentials::default(),
            variables: HashMap::new(),
            workspace: workspace.into(),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables = variables;
        self
    }
}

/// What became of a request
#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// The trigger did not match; nothing ran
    NotTriggered { pipeline_name: String },

    /// A run executed and reached a terminal status
    Finished(RunContext),
}

impl RunOutcome {
    pub fn pipeline_name(&self) -> &str {
        match self {
            RunOutcome::NotTriggered { pipeline_name } => pipeline_name,
            RunOutcome::Finished(ctx) => &ctx.pipeline_name,
        }
    }

    pub fn context(&self) -> Option<&RunContext> {
        match self {
            RunOutcome::NotTriggered { .. } => None,
            RunOutcome::Finished(ctx) => Some(ctx),
        }
    }

    /// Whether the outcome is acceptable: not triggered, or succeeded
    pub fn is_success(&self) -> bool {
        match self {
            RunOutcome::NotTriggered { .. } => true,
            RunOutcome::Finished(ctx) => ctx.status == ExecutionStatus::Succeeded,
        }
    }
}

/// Main pipeline execution engine
pub struct ExecutionEngine {
    executor: StepExecutor,
    event_handlers: Vec<EventHandler>,
}

impl ExecutionEngine {
    pub fn new(actions: ActionRegistry) -> Self {
        Self {
            executor: StepExecutor::new(actions),
            event_handlers: Vec::new(),
        }
    }

    /// Add an event handler
    pub fn add_event_handler<F>(&mut self, handler: F)
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.event_handlers.push(Arc::new(handler));
    }

    pub fn with_event_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(ExecutionEvent) + Send + Sync + 'static,
    {
        self.add_event_handler(handler);
        self
    }

    pub fn actions(&self) -> &ActionRegistry {
        self.executor.actions()
    }

    /// Emit an event to all handlers
    fn emit_event(&self, event: ExecutionEvent) {
        for handler in &self.event_handlers {
            handler(event.clone());
        }
    }

    /// Evaluate the trigger and, if it matches, execute the pipeline
    pub async fn run(&self, request: &RunRequest) -> RunOutcome {
        let pipeline = &request.pipeline;

        if !pipeline.is_triggered_by(&request.event) {
            info!(
                "Pipeline {} not triggered by {} {}",
                pipeline.name,
                request.event.kind.as_str(),
                request.event.git_ref
            );
            self.emit_event(ExecutionEvent::RunSkipped {
                pipeline_name: pipeline.name.clone(),
                git_ref: request.event.git_ref.clone(),
            });
            return RunOutcome::NotTriggered {
                pipeline_name: pipeline.name.clone(),
            };
        }

        let mut ctx = RunContext::new(
            pipeline,
            request.event.clone(),
            request.credentials.clone(),
            &request.variables,
            &request.workspace,
        );
        ctx.start();

        info!("Starting pipeline execution: {} ({})", pipeline.name, ctx.run_id);
        self.emit_event(ExecutionEvent::RunStarted {
            run_id: ctx.run_id,
            pipeline_name: pipeline.name.clone(),
            total_steps: pipeline.steps.len(),
        });

        let emit = |event: ExecutionEvent| self.emit_event(event);
        self.executor.run_steps(&pipeline.steps, &mut ctx, &emit).await;

        match ctx.aborting_result() {
            Some(failed) => {
                warn!("Pipeline {} failed at step {}", pipeline.name, failed.step_id);
                ctx.fail();
            }
            None => ctx.succeed(),
        }

        info!(
            "Pipeline execution finished: {} - {}",
            pipeline.name, ctx.status
        );
        self.emit_event(ExecutionEvent::RunFinished {
            run_id: ctx.run_id,
            pipeline_name: pipeline.name.clone(),
            status: ctx.status,
        });

        RunOutcome::Finished(ctx)
    }

    /// Execute independent requests concurrently
    ///
    /// Each run owns its own context; outcomes come back in request order.
    pub async fn run_all(&self, requests: &[RunRequest]) -> Vec<RunOutcome> {
        join_all(requests.iter().map(|request| self.run(request))).await
    }
}
