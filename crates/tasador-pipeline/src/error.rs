//! Error types for pipeline construction and step execution.

use tasador_core::{DatasetError, TasadorError};
use thiserror::Error;

/// Why a single step attempt failed.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Domain(#[from] TasadorError),

    /// An upstream step finished without the output this step consumes.
    #[error("step '{step}' needs the output of '{upstream}'")]
    MissingInput { step: String, upstream: String },

    #[error("timed out after {limit_ms}ms")]
    TimedOut { limit_ms: u64 },
}

impl StepError {
    /// Whether the runner may retry the attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            StepError::Domain(err) => err.is_transient(),
            StepError::TimedOut { .. } => true,
            StepError::MissingInput { .. } => false,
        }
    }
}

impl From<DatasetError> for StepError {
    fn from(err: DatasetError) -> Self {
        StepError::Domain(err.into())
    }
}

/// Errors produced while building or running a pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("step '{0}' registered twice")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle detected involving steps: {steps:?}")]
    Cycle { steps: Vec<String> },

    /// A step exhausted its attempts.
    #[error("step '{step}' failed after {attempts} attempt(s): {source}")]
    StepFailed {
        step: String,
        attempts: u32,
        #[source]
        source: StepError,
    },
}

/// Convenience result alias.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
