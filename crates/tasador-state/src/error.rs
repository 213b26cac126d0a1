//! Error types for tasador-state

use thiserror::Error;

/// Errors that can occur in the tracking/registry persistence layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// Backend could not be reached (connection refused, timeout, 5xx)
    #[error("registry backend unavailable: {0}")]
    Unavailable(String),

    /// Backend reached but the operation failed
    #[error("registry backend error: {0}")]
    Backend(String),

    /// Run not found
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// Registered model not found
    #[error("registered model not found: {name}")]
    ModelNotFound { name: String },

    /// Model version not found
    #[error("version {version} of model {name} not found")]
    VersionNotFound { name: String, version: u64 },

    /// Artifact not found in the artifact store
    #[error("artifact not found: {digest}")]
    ArtifactNotFound { digest: String },

    /// Artifact digest is not valid hex
    #[error("invalid artifact digest: {digest}")]
    InvalidDigest { digest: String },

    /// Unknown stage label
    #[error("invalid stage: {0}")]
    InvalidStage(String),

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// IO error (filesystem artifact store)
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Whether the error means the backend was not reachable at all.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        if is_surreal_transport(&err) {
            StorageError::Unavailable(err.to_string())
        } else {
            StorageError::Backend(err.to_string())
        }
    }
}

/// Lost or missing connections and query timeouts.
fn is_surreal_transport(err: &surrealdb::Error) -> bool {
    use surrealdb::error::{Api, Db};

    match err {
        surrealdb::Error::Api(api) => matches!(api, Api::Ws(_) | Api::ConnectionUninitialised),
        surrealdb::Error::Db(db) => matches!(db, Db::QueryTimedout),
        #[allow(unreachable_patterns)]
        _ => false,
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            StorageError::Unavailable(err.to_string())
        } else if err.is_decode() {
            StorageError::Serialization(err.to_string())
        } else {
            StorageError::Backend(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_is_classified() {
        assert!(StorageError::Unavailable("refused".into()).is_unavailable());
        assert!(!StorageError::Backend("bad request".into()).is_unavailable());
    }

    #[test]
    fn surreal_transport_errors_are_unavailable() {
        use surrealdb::error::{Api, Db};

        let dropped: StorageError = surrealdb::Error::Api(Api::Ws("connection reset".into())).into();
        assert!(dropped.is_unavailable());

        let closed: StorageError = surrealdb::Error::Api(Api::ConnectionUninitialised).into();
        assert!(closed.is_unavailable());

        let timed_out: StorageError = surrealdb::Error::Db(Db::QueryTimedout).into();
        assert!(timed_out.is_unavailable());
    }

    #[test]
    fn surreal_query_errors_stay_backend() {
        use surrealdb::error::Db;

        let thrown: StorageError = surrealdb::Error::Db(Db::Thrown("bad record".into())).into();
        assert!(matches!(thrown, StorageError::Backend(_)));
    }

    #[test]
    fn version_not_found_display() {
        let err = StorageError::VersionNotFound {
            name: "real_estate_model".to_string(),
            version: 7,
        };
        let msg = err.to_string();
        assert!(msg.contains("real_estate_model"));
        assert!(msg.contains('7'));
    }
}
