//! Configuration: registry credentials from the environment and pipeline
//! settings from TOML.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tasador_state::MlflowConfig;

pub const ENV_S3_ENDPOINT_URL: &str = "MLFLOW_S3_ENDPOINT_URL";
pub const ENV_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";
pub const ENV_TRACKING_URI: &str = "MLFLOW_TRACKING_URI";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },

    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// RegistryConfig
// ---------------------------------------------------------------------------

/// Remote registry and object store settings.
///
/// All five values are required before any remote registry write.
#[derive(Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    pub s3_endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub default_region: String,
    pub tracking_uri: String,
}

impl RegistryConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read through `lookup`; empty values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |key: &'static str| -> Result<String, ConfigError> {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or(ConfigError::MissingEnv(key))
        };

        let config = Self {
            s3_endpoint_url: require(ENV_S3_ENDPOINT_URL)?,
            access_key_id: require(ENV_ACCESS_KEY_ID)?,
            secret_access_key: require(ENV_SECRET_ACCESS_KEY)?,
            default_region: require(ENV_DEFAULT_REGION)?,
            tracking_uri: require(ENV_TRACKING_URI)?,
        };

        for (key, url) in [
            (ENV_S3_ENDPOINT_URL, &config.s3_endpoint_url),
            (ENV_TRACKING_URI, &config.tracking_uri),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(invalid(key, format!("'{}' is not an http(s) URL", url)));
            }
        }

        Ok(config)
    }

    /// Client settings for the tracking server.
    pub fn mlflow(&self, timeout: Duration) -> MlflowConfig {
        MlflowConfig::new(&self.tracking_uri).with_timeout(timeout)
    }
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryConfig")
            .field("s3_endpoint_url", &self.s3_endpoint_url)
            .field("access_key_id", &"<redacted>")
            .field("secret_access_key", &"<redacted>")
            .field("default_region", &self.default_region)
            .field("tracking_uri", &self.tracking_uri)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Backend selection
// ---------------------------------------------------------------------------

/// Which tracking backend to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// MLflow tracking server (needs `RegistryConfig`)
    #[default]
    Mlflow,
    /// SurrealDB registry with a local artifact directory
    Surreal,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Mlflow => f.write_str("mlflow"),
            BackendKind::Surreal => f.write_str("surreal"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mlflow" => Ok(BackendKind::Mlflow),
            "surreal" | "surrealdb" => Ok(BackendKind::Surreal),
            other => Err(invalid("backend", format!("unknown backend '{}'", other))),
        }
    }
}

/// Backend section of the pipeline config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// SurrealDB URL (`mem://`, `surrealkv://path`, `ws://host:port`)
    pub surreal_url: String,
    /// Artifact directory for the surreal backend
    pub artifact_dir: PathBuf,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            surreal_url: "surrealkv://.tasador/db".to_string(),
            artifact_dir: PathBuf::from(".tasador/artifacts"),
        }
    }
}

// ---------------------------------------------------------------------------
// PipelineConfig
// ---------------------------------------------------------------------------

/// Retry policy for pipeline steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per step, including the first
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Settings for ingest, processing, training and promotion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub raw_data: PathBuf,
    pub processed_data: PathBuf,
    pub model_name: String,
    pub experiment_name: String,
    pub artifact_location: Option<String>,
    /// Run metric the promotion policy ranks versions by
    pub metric_key: String,
    pub features: Vec<String>,
    pub target: String,
    pub test_fraction: f64,
    pub seed: Option<u64>,
    pub min_rows: usize,
    pub registry_timeout_secs: u64,
    pub retry: RetryConfig,
    pub backend: BackendConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            raw_data: PathBuf::from("data/properties_batch.csv"),
            processed_data: PathBuf::from("data/processed_properties.csv"),
            model_name: "real_estate_model".to_string(),
            experiment_name: "real_estate_exp".to_string(),
            artifact_location: Some("s3://mlflow-artifacts/experiments/".to_string()),
            metric_key: "r2_score".to_string(),
            features: vec!["bed".into(), "bath".into(), "house_size".into()],
            target: "price".to_string(),
            test_fraction: 0.2,
            seed: None,
            min_rows: 10,
            registry_timeout_secs: 30,
            retry: RetryConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load and validate a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_name.trim().is_empty() {
            return Err(invalid("model_name", "must not be empty"));
        }
        if self.metric_key.trim().is_empty() {
            return Err(invalid("metric_key", "must not be empty"));
        }
        if self.features.is_empty() {
            return Err(invalid("features", "at least one feature is required"));
        }
        if self.features.iter().any(|f| f == &self.target) {
            return Err(invalid("features", "target column cannot be a feature"));
        }
        if !(self.test_fraction > 0.0 && self.test_fraction < 1.0) {
            return Err(invalid("test_fraction", "must be between 0 and 1"));
        }
        if self.min_rows < 2 {
            return Err(invalid("min_rows", "must be at least 2"));
        }
        if self.registry_timeout_secs == 0 {
            return Err(invalid("registry_timeout_secs", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        Ok(())
    }

    pub fn registry_timeout(&self) -> Duration {
        Duration::from_secs(self.registry_timeout_secs)
    }
}
