//! Domain-level error taxonomy for Tasador.

use tasador_state::StorageError;

use crate::config::ConfigError;
use crate::dataset::DatasetError;
use crate::executor::PartialPromotion;
use crate::model::ModelError;

/// Tasador domain errors.
///
/// Registry failures are classified by kind so callers branch on the
/// variant instead of matching on messages.
#[derive(Debug, thiserror::Error)]
pub enum TasadorError {
    /// Transport failure or timeout talking to the registry or object store
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Experiment lookup/creation failed; callers continue without one
    #[error("experiment setup failed for '{name}': {reason}")]
    ExperimentSetupFailed { name: String, reason: String },

    /// Artifact upload or registration failed; callers fall back to metrics only
    #[error("model logging failed: {0}")]
    ModelLoggingFailed(String),

    /// A version's run has no value for the configured metric
    #[error("version {version} has no usable '{metric}' metric")]
    MetricMissing { version: u64, metric: String },

    /// No version of the model has a usable metric
    #[error("no promotion candidate for model '{0}'")]
    NoPromotionCandidate(String),

    #[error("version {version} of model '{name}' not found")]
    VersionNotFound { name: String, version: u64 },

    /// Target promoted but older Production versions were not all archived
    #[error("{0}")]
    PartialPromotion(PartialPromotion),

    /// Serving has no model loaded
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// Registry reached but rejected the operation
    #[error("registry error: {0}")]
    Registry(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("dataset error: {0}")]
    Dataset(#[from] DatasetError),

    /// Version exists but is not in the stage the operation requires
    #[error("version {version} of model '{name}' is {stage}, expected {expected}")]
    StageConflict {
        name: String,
        version: u64,
        stage: String,
        expected: String,
    },

    #[error("training failed: {0}")]
    Training(String),

    #[error("model error: {0}")]
    Model(#[from] ModelError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl TasadorError {
    /// Whether retrying the same call could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TasadorError::RegistryUnavailable(_) | TasadorError::PartialPromotion(_)
        )
    }
}

impl From<StorageError> for TasadorError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Unavailable(msg) => TasadorError::RegistryUnavailable(msg),
            StorageError::VersionNotFound { name, version } => {
                TasadorError::VersionNotFound { name, version }
            }
            StorageError::Io(e) => TasadorError::Io(e),
            other => TasadorError::Registry(other.to_string()),
        }
    }
}

/// Result type for Tasador domain operations.
pub type Result<T> = std::result::Result<T, TasadorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_map_by_kind() {
        let err: TasadorError = StorageError::Unavailable("connection refused".into()).into();
        assert!(matches!(err, TasadorError::RegistryUnavailable(_)));
        assert!(err.is_transient());

        let err: TasadorError = StorageError::VersionNotFound {
            name: "m".into(),
            version: 7,
        }
        .into();
        assert!(matches!(err, TasadorError::VersionNotFound { version: 7, .. }));
        assert!(!err.is_transient());

        let err: TasadorError = StorageError::InvalidStage("Live".into()).into();
        assert!(err.to_string().contains("registry error"));
    }

    #[test]
    fn metric_missing_names_the_metric() {
        let err = TasadorError::MetricMissing {
            version: 3,
            metric: "r2_score".into(),
        };
        assert!(err.to_string().contains("r2_score"));
        assert!(err.to_string().contains('3'));
    }
}
