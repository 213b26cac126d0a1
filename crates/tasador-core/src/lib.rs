//! Tasador Core Library
//!
//! Domain logic for the real-estate price model: dataset preparation,
//! training and run recording, the promotion policy and stage transition
//! executor, and the serving loader. Persistence lives in `tasador-state`.

pub mod backend;
pub mod config;
pub mod dataset;
pub mod deadline;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod model;
pub mod obs;
pub mod policy;
pub mod recorder;
pub mod serving;
pub mod telemetry;
pub mod trainer;

pub use backend::Backend;
pub use config::{BackendConfig, BackendKind, ConfigError, PipelineConfig, RegistryConfig, RetryConfig};
pub use dataset::{ingest, process, DatasetError, IngestSummary, ProcessSummary, Table, TrainingFrame};
pub use error::{Result, TasadorError};
pub use executor::{
    promote_best, PartialPromotion, PromotionLocks, PromotionResult, PromotionStatus,
    StageExecutor,
};
pub use model::{r2_score, LinearModel, ModelError};
pub use policy::{Candidate, PromotionPolicy, SelectionReport, SkipReason, SkippedVersion};
pub use recorder::{LoggedRun, RunRecorder};
pub use serving::{LoadedModel, ModelHolder, ServingLoader};
pub use trainer::{fit_and_score, FitOutcome, Trainer, TrainingReport};

pub use metrics::METRICS;
pub use obs::PipelineSpan;
pub use telemetry::init_tracing;

/// Tasador version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
