//! Core domain models for Pipeline
//!
//! This module defines the fundamental data structures that represent
//! pipelines, steps, triggers and runs.

pub mod config;
pub mod context;
pub mod error;
pub mod expression;
pub mod pipeline;
pub mod state;
pub mod step;
pub mod trigger;

pub use config::{FailurePolicy, PipelineConfig, Settings};
pub use context::{Artifact, Credentials, RunContext, StepResult};
pub use error::PipelineError;
pub use pipeline::Pipeline;
pub use state::ExecutionStatus;
pub use step::{Step, StepKind};
pub use trigger::{Event, EventKind, PushFilter, TriggerRule};
