//! Tasador-State: tracking and model registry persistence
//!
//! This crate owns all I/O with the tracking backend: experiments, training
//! runs, registered model versions with their lifecycle stages, and the
//! model artifacts those versions point at.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: durable records, monotonic version numbers, stage transitions.
//!
//! ## Backends
//!
//! - `MlflowClient`: MLflow tracking server over REST (runs, registry, artifact proxy)
//! - `SurrealRegistry` + `FsArtifactStore`: self-hosted SurrealDB and local blobs
//! - `fakes`: in-memory implementations with scripted fault injection

mod error;
pub mod fakes;
pub mod fs_artifacts;
mod handle;
pub mod mlflow;
pub mod storage_traits;
pub mod surreal_registry;

pub use error::StorageError;
pub use fs_artifacts::FsArtifactStore;
pub use handle::{SurrealConfig, SurrealHandle, DEFAULT_DATABASE, DEFAULT_NAMESPACE};
pub use mlflow::{MlflowClient, MlflowConfig};
pub use storage_traits::{
    ArtifactStore, ContentDigest, Experiment, ExperimentStore, ModelRegistry, ModelVersion,
    ParamValue, RunDraft, RunId, RunRecord, RunStore, Stage, StorageResult, TrackingBackend,
};
pub use surreal_registry::SurrealRegistry;
