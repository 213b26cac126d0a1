//! Tasador Pipeline
//!
//! Runs the training flow as an explicit DAG of typed steps:
//! - [`StepGraph`] validates dependencies and orders steps
//! - [`PipelineRunner`] applies timeouts, retries transient failures and
//!   skips everything downstream of a failed step
//! - [`estate_pipeline`] wires ingest → process → train → promote

pub mod error;
pub mod estate;
pub mod graph;
pub mod runner;
pub mod step;

pub use error::{PipelineError, PipelineResult, StepError};
pub use estate::{estate_pipeline, IngestStep, ProcessStep, PromoteStep, TrainStep};
pub use graph::StepGraph;
pub use runner::{PipelineReport, PipelineRunner, StepRecord, StepStatus};
pub use step::{PromotionOutcome, Step, StepContext, StepOutput};
