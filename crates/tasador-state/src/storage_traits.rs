//! Storage trait definitions for Tasador
//!
//! These traits define the tracking and registry abstractions:
//! - `ArtifactStore`: Content-addressed model artifacts (put/get by digest)
//! - `ExperimentStore`: Experiment lookup and creation
//! - `RunStore`: Immutable training-run records (params, metrics, artifact)
//! - `ModelRegistry`: Registered models, versions and lifecycle stages
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ArtifactStore: Content-Addressed Model Artifacts
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.0
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed artifact store.
///
/// Guarantees:
/// - `put(data)` always returns the SHA-256 digest of `data`.
/// - `get(digest)` returns the exact bytes previously stored.
/// - Same content always yields the same digest (deduplication).
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store bytes and return their content digest.
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// Retrieve bytes by digest. Returns `StorageError::ArtifactNotFound` if absent.
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    /// Check whether a digest exists in the store.
    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// ExperimentStore
// ---------------------------------------------------------------------------

/// Experiment grouping runs under a common artifact location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: String,
    pub name: String,
    pub artifact_location: Option<String>,
}

#[async_trait]
pub trait ExperimentStore: Send + Sync {
    /// Look up an experiment by its unique name.
    async fn get_experiment_by_name(&self, name: &str) -> StorageResult<Option<Experiment>>;

    /// Create a new experiment. Fails if the name is already taken.
    async fn create_experiment(
        &self,
        name: &str,
        artifact_location: Option<&str>,
    ) -> StorageResult<Experiment>;

    /// Idempotent lookup-or-create by name.
    async fn get_or_create_experiment(
        &self,
        name: &str,
        artifact_location: Option<&str>,
    ) -> StorageResult<Experiment> {
        if let Some(existing) = self.get_experiment_by_name(name).await? {
            return Ok(existing);
        }
        self.create_experiment(name, artifact_location).await
    }
}

// ---------------------------------------------------------------------------
// RunStore: Training Attempts
// ---------------------------------------------------------------------------

/// Unique identifier for a training run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().simple().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Parameter value logged with a run: a single string or a list of strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Text(String),
    List(Vec<String>),
}

impl ParamValue {
    /// Flat string form used by backends that only store string params.
    pub fn to_flat_string(&self) -> String {
        match self {
            ParamValue::Text(s) => s.clone(),
            ParamValue::List(items) => {
                serde_json::to_string(items).unwrap_or_else(|_| items.join(","))
            }
        }
    }

    /// Inverse of [`ParamValue::to_flat_string`].
    pub fn from_flat_string(raw: &str) -> Self {
        if raw.starts_with('[') {
            if let Ok(items) = serde_json::from_str::<Vec<String>>(raw) {
                return ParamValue::List(items);
            }
        }
        ParamValue::Text(raw.to_string())
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Text(s.to_string())
    }
}

impl From<Vec<String>> for ParamValue {
    fn from(items: Vec<String>) -> Self {
        ParamValue::List(items)
    }
}

/// Everything a run carries at creation time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunDraft {
    pub experiment_id: Option<String>,
    pub params: BTreeMap<String, ParamValue>,
    pub metrics: BTreeMap<String, f64>,
    pub artifact: Option<ContentDigest>,
}

impl RunDraft {
    pub fn new(experiment_id: Option<String>) -> Self {
        Self {
            experiment_id,
            ..Self::default()
        }
    }

    pub fn param(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn metric(mut self, key: &str, value: f64) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }

    pub fn artifact(mut self, digest: ContentDigest) -> Self {
        self.artifact = Some(digest);
        self
    }

    /// Same draft with the artifact reference removed.
    pub fn metrics_only(&self) -> Self {
        Self {
            artifact: None,
            ..self.clone()
        }
    }
}

/// Immutable run record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub experiment_id: Option<String>,
    pub params: BTreeMap<String, ParamValue>,
    pub metrics: BTreeMap<String, f64>,
    pub artifact: Option<ContentDigest>,
    pub created_at: DateTime<Utc>,
}

impl RunRecord {
    /// Value of a metric, if it was recorded.
    pub fn metric(&self, key: &str) -> Option<f64> {
        self.metrics.get(key).copied()
    }
}

/// Store of training runs.
///
/// Guarantees:
/// - A run is created exactly once and never mutated afterwards.
/// - `get_run` returns `StorageError::RunNotFound` for unknown ids.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Persist a new run and return the stored record.
    ///
    /// An error leaves no live run behind, so a caller may retry with a
    /// different draft without duplicating the training attempt.
    async fn create_run(&self, draft: RunDraft) -> StorageResult<RunRecord>;

    /// Retrieve a run record by id.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord>;
}

// ---------------------------------------------------------------------------
// ModelRegistry: Versions and Stages
// ---------------------------------------------------------------------------

/// Lifecycle stage of a model version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Stage {
    #[default]
    None,
    Staging,
    Production,
    Archived,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::None => "None",
            Stage::Staging => "Staging",
            Stage::Production => "Production",
            Stage::Archived => "Archived",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = StorageError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(Stage::None),
            "staging" => Ok(Stage::Staging),
            "production" => Ok(Stage::Production),
            "archived" => Ok(Stage::Archived),
            _ => Err(StorageError::InvalidStage(s.to_string())),
        }
    }
}

/// A registered version of a named model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    pub name: String,
    pub version: u64,
    pub run_id: RunId,
    pub source: Option<ContentDigest>,
    pub stage: Stage,
    pub created_at: DateTime<Utc>,
}

/// Model registry.
///
/// Semantics:
/// - `register_version` assigns the next version number for `name`
///   (strictly increasing, never reused) with stage `None`.
/// - `list_versions` returns every version ever registered under `name`,
///   ordered by ascending version number; unknown names yield an empty list.
/// - `set_stage` changes only the stage. With `archive_existing`, every other
///   version of the same model currently in the target stage is archived.
#[async_trait]
pub trait ModelRegistry: Send + Sync {
    /// Register a run's artifact as a new version of `name`.
    async fn register_version(
        &self,
        name: &str,
        run_id: &RunId,
        source: Option<&ContentDigest>,
    ) -> StorageResult<ModelVersion>;

    /// All versions of `name`, ascending by version number.
    async fn list_versions(&self, name: &str) -> StorageResult<Vec<ModelVersion>>;

    /// Transition a version to `stage`.
    async fn set_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        archive_existing: bool,
    ) -> StorageResult<ModelVersion>;

    /// Fetch a single version.
    async fn get_version(&self, name: &str, version: u64) -> StorageResult<ModelVersion> {
        self.list_versions(name)
            .await?
            .into_iter()
            .find(|v| v.version == version)
            .ok_or_else(|| StorageError::VersionNotFound {
                name: name.to_string(),
                version,
            })
    }
}

/// A full tracking backend: experiments, runs and the model registry.
pub trait TrackingBackend: ExperimentStore + RunStore + ModelRegistry {}

impl<T> TrackingBackend for T where T: ExperimentStore + RunStore + ModelRegistry {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_rejects_short_hex() {
        let err = ContentDigest::try_from("abcd".to_string()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidDigest { .. }));
    }

    #[test]
    fn digest_serde_validates() {
        let d = ContentDigest::from_bytes(b"model");
        let json = serde_json::to_string(&d).unwrap();
        let back: ContentDigest = serde_json::from_str(&json).unwrap();
        assert_eq!(d, back);
        assert!(serde_json::from_str::<ContentDigest>("\"not-hex\"").is_err());
    }

    #[test]
    fn stage_parses_case_insensitively() {
        assert_eq!("production".parse::<Stage>().unwrap(), Stage::Production);
        assert_eq!("Archived".parse::<Stage>().unwrap(), Stage::Archived);
        assert_eq!("NONE".parse::<Stage>().unwrap(), Stage::None);
        assert!("live".parse::<Stage>().is_err());
    }

    #[test]
    fn param_list_survives_flattening() {
        let value = ParamValue::List(vec!["bed".into(), "bath".into(), "house_size".into()]);
        let flat = value.to_flat_string();
        assert_eq!(flat, r#"["bed","bath","house_size"]"#);
        assert_eq!(ParamValue::from_flat_string(&flat), value);
        assert_eq!(
            ParamValue::from_flat_string("linear"),
            ParamValue::Text("linear".into())
        );
    }

    #[test]
    fn metrics_only_drops_artifact() {
        let draft = RunDraft::new(None)
            .metric("r2_score", 0.8)
            .artifact(ContentDigest::from_bytes(b"m"));
        let bare = draft.metrics_only();
        assert!(bare.artifact.is_none());
        assert_eq!(bare.metrics.get("r2_score"), Some(&0.8));
    }
}
