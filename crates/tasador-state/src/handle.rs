//! SurrealDB Handle - Connection and Schema
//!
//! Supports in-memory (`mem://`), embedded on-disk (`surrealkv://path`)
//! and remote (`ws://`, `wss://`) connections. The schema is applied on
//! every connect.

use surrealdb::engine::any::Any;
use surrealdb::opt::auth::Root;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::error::StorageError;
use crate::storage_traits::StorageResult;

/// Default namespace for Tasador tables
pub const DEFAULT_NAMESPACE: &str = "tasador";
/// Default database for Tasador tables
pub const DEFAULT_DATABASE: &str = "registry";

/// Connection settings for the SurrealDB registry backend
#[derive(Debug, Clone)]
pub struct SurrealConfig {
    /// Connection URL (`mem://`, `surrealkv://.tasador/db`, `wss://...`)
    pub url: String,
    /// Root credentials, required only for remote servers
    pub credentials: Option<(String, String)>,
    pub namespace: String,
    pub database: String,
}

impl SurrealConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            namespace: DEFAULT_NAMESPACE.to_string(),
            database: DEFAULT_DATABASE.to_string(),
        }
    }

    /// In-memory database, lost when the process exits
    pub fn in_memory() -> Self {
        Self::new("mem://")
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Create from environment variables
    ///
    /// Reads:
    /// - TASADOR_SURREAL_URL (optional, default: "surrealkv://.tasador/db")
    /// - TASADOR_SURREAL_USER / TASADOR_SURREAL_PASS (optional, both or neither)
    pub fn from_env() -> Self {
        let url = std::env::var("TASADOR_SURREAL_URL")
            .unwrap_or_else(|_| "surrealkv://.tasador/db".to_string());
        let mut config = Self::new(url);
        if let (Ok(user), Ok(pass)) = (
            std::env::var("TASADOR_SURREAL_USER"),
            std::env::var("TASADOR_SURREAL_PASS"),
        ) {
            config = config.with_credentials(&user, &pass);
        }
        config
    }
}

/// SurrealDB connection handle
#[derive(Clone)]
pub struct SurrealHandle {
    db: Surreal<Any>,
}

impl SurrealHandle {
    /// Connect to an in-memory database and set up schema
    pub async fn setup_db() -> StorageResult<Self> {
        Self::connect(&SurrealConfig::in_memory()).await
    }

    /// Connect using the given configuration and apply the schema
    #[instrument(skip(config), fields(url = %config.url, namespace = %config.namespace))]
    pub async fn connect(config: &SurrealConfig) -> StorageResult<Self> {
        info!("Connecting to SurrealDB");

        if let Some(path) = config.url.strip_prefix("surrealkv://") {
            std::fs::create_dir_all(path)?;
        }

        let db = surrealdb::engine::any::connect(config.url.as_str())
            .await
            .map_err(|e| {
                StorageError::Unavailable(format!("failed to connect to {}: {}", config.url, e))
            })?;

        if let Some((username, password)) = &config.credentials {
            db.signin(Root {
                username: username.as_str(),
                password: password.as_str(),
            })
            .await
            .map_err(|e| StorageError::Unavailable(format!("authentication failed: {}", e)))?;
        }

        db.use_ns(config.namespace.as_str())
            .use_db(config.database.as_str())
            .await
            .map_err(|e| StorageError::Unavailable(e.to_string()))?;

        let handle = SurrealHandle { db };
        handle.init_schema().await?;

        info!("SurrealDB connected and schema initialized");
        Ok(handle)
    }

    pub(crate) fn db(&self) -> &Surreal<Any> {
        &self.db
    }

    async fn init_schema(&self) -> StorageResult<()> {
        debug!("Initializing Tasador schema");

        let schema = r#"
            -- Experiments
            DEFINE TABLE experiments SCHEMAFULL;
            DEFINE FIELD experiment_id ON experiments TYPE string;
            DEFINE FIELD name ON experiments TYPE string;
            DEFINE FIELD artifact_location ON experiments TYPE option<string>;
            DEFINE INDEX idx_experiment_name ON experiments FIELDS name UNIQUE;

            -- Runs (immutable once created)
            DEFINE TABLE runs SCHEMAFULL;
            DEFINE FIELD run_id ON runs TYPE string;
            DEFINE FIELD experiment_id ON runs TYPE option<string>;
            DEFINE FIELD params ON runs FLEXIBLE TYPE object;
            DEFINE FIELD metrics ON runs FLEXIBLE TYPE object;
            DEFINE FIELD artifact ON runs TYPE option<string>;
            DEFINE FIELD created_at ON runs TYPE datetime;
            DEFINE INDEX idx_run_id ON runs FIELDS run_id UNIQUE;

            -- Model versions (never deleted)
            DEFINE TABLE model_versions SCHEMAFULL;
            DEFINE FIELD name ON model_versions TYPE string;
            DEFINE FIELD version ON model_versions TYPE int;
            DEFINE FIELD run_id ON model_versions TYPE string;
            DEFINE FIELD source ON model_versions TYPE option<string>;
            DEFINE FIELD stage ON model_versions TYPE string;
            DEFINE FIELD created_at ON model_versions TYPE datetime;
            DEFINE INDEX idx_model_version ON model_versions FIELDS name, version UNIQUE;
            DEFINE INDEX idx_model_stage ON model_versions FIELDS name, stage;
        "#;

        self.db
            .query(schema)
            .await
            .map_err(|e| StorageError::Backend(format!("schema setup failed: {}", e)))?;

        debug!("Schema initialized successfully");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = SurrealConfig::new("mem://").with_credentials("root", "secret");
        assert_eq!(config.namespace, DEFAULT_NAMESPACE);
        assert_eq!(config.database, DEFAULT_DATABASE);
        assert_eq!(
            config.credentials,
            Some(("root".to_string(), "secret".to_string()))
        );
    }

    #[tokio::test]
    async fn in_memory_connects() {
        assert!(SurrealHandle::setup_db().await.is_ok());
    }
}
