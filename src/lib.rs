//! dockhand - event-triggered pipelines that build an artifact and publish
//! container images

pub mod actions;
pub mod cli;
pub mod core;
pub mod execution;
pub mod persistence;
pub mod runtime;

// Re-export commonly used types
pub use actions::{Action, ActionRegistry};
pub use core::{Event, ExecutionStatus, Pipeline, PipelineConfig, PipelineError, RunContext, Step};
pub use execution::{ExecutionEngine, ExecutionEvent, RunOutcome, RunRequest};
pub use runtime::{ContainerRuntime, DockerCli};
