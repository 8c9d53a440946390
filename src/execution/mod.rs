//! Pipeline execution engine

pub mod engine;
pub mod executor;

pub use engine::{EventHandler, ExecutionEngine, ExecutionEvent, RunOutcome, RunRequest};
pub use executor::{ExecutionResult, StepExecutor};
