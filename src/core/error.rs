//! Step failure kinds

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that fail a step (and, under the abort policy, the run)
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum PipelineError {
    /// The artifact build tool failed or produced no artifact
    #[error("Build error: {0}")]
    BuildError(String),

    /// The registry rejected the supplied credential
    #[error("Auth error: {0}")]
    AuthError(String),

    /// Building, tagging or pushing the image failed
    #[error("Publish error: {0}")]
    PublishError(String),

    /// Any other step failure (non-zero exit, bad input, timeout)
    #[error("Step error: {0}")]
    StepError(String),
}

impl PipelineError {
    /// Short kind label used in console output and history
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::BuildError(_) => "BuildError",
            PipelineError::AuthError(_) => "AuthError",
            PipelineError::PublishError(_) => "PublishError",
            PipelineError::StepError(_) => "StepError",
        }
    }

    /// The message without the kind prefix
    pub fn message(&self) -> &str {
        match self {
            PipelineError::BuildError(m)
            | PipelineError::AuthError(m)
            | PipelineError::PublishError(m)
            | PipelineError::StepError(m) => m,
        }
    }

    /// Same kind with the message rewritten
    pub fn map_message(self, f: impl FnOnce(&str) -> String) -> Self {
        match self {
            PipelineError::BuildError(m) => PipelineError::BuildError(f(&m)),
            PipelineError::AuthError(m) => PipelineError::AuthError(f(&m)),
            PipelineError::PublishError(m) => PipelineError::PublishError(f(&m)),
            PipelineError::StepError(m) => PipelineError::StepError(f(&m)),
        }
    }
}
