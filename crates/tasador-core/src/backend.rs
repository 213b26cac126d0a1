//! Backend wiring: connect the configured tracking backend and hand out
//! the components built on top of it.

use std::sync::Arc;
use std::time::Duration;

use tasador_state::fakes::{MemoryArtifactStore, MemoryTracking};
use tasador_state::{
    ArtifactStore, FsArtifactStore, MlflowClient, SurrealConfig, SurrealHandle, SurrealRegistry,
    TrackingBackend,
};
use tracing::info;

use crate::config::{BackendKind, PipelineConfig, RegistryConfig};
use crate::error::Result;
use crate::executor::{PromotionLocks, StageExecutor};
use crate::policy::PromotionPolicy;
use crate::recorder::RunRecorder;
use crate::serving::ServingLoader;
use crate::trainer::Trainer;

/// A connected tracking backend plus artifact store.
#[derive(Clone)]
pub struct Backend {
    tracking: Arc<dyn TrackingBackend>,
    artifacts: Arc<dyn ArtifactStore>,
    locks: PromotionLocks,
    timeout: Duration,
}

impl Backend {
    pub fn from_parts(
        tracking: Arc<dyn TrackingBackend>,
        artifacts: Arc<dyn ArtifactStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            tracking,
            artifacts,
            locks: PromotionLocks::new(),
            timeout,
        }
    }

    /// Fresh in-memory backend.
    pub fn in_memory(timeout: Duration) -> Self {
        Self::from_parts(
            Arc::new(MemoryTracking::new()),
            Arc::new(MemoryArtifactStore::new()),
            timeout,
        )
    }

    /// Connect as configured. The MLflow backend reads `RegistryConfig`
    /// from the environment.
    pub async fn connect(config: &PipelineConfig) -> Result<Self> {
        match config.backend.kind {
            BackendKind::Mlflow => {
                let registry = RegistryConfig::from_env()?;
                Self::connect_mlflow(&registry, config.registry_timeout())
            }
            BackendKind::Surreal => Self::connect_surreal(config).await,
        }
    }

    pub fn connect_mlflow(registry: &RegistryConfig, timeout: Duration) -> Result<Self> {
        let client = MlflowClient::new(registry.mlflow(timeout))?;
        info!(tracking_uri = %client.tracking_uri(), "using MLflow backend");
        let client = Arc::new(client);
        Ok(Self::from_parts(client.clone(), client, timeout))
    }

    pub async fn connect_surreal(config: &PipelineConfig) -> Result<Self> {
        let handle = SurrealHandle::connect(&SurrealConfig::new(&config.backend.surreal_url)).await?;
        let artifacts = FsArtifactStore::new(&config.backend.artifact_dir)?;
        info!(
            url = %config.backend.surreal_url,
            artifacts = %config.backend.artifact_dir.display(),
            "using SurrealDB backend"
        );
        Ok(Self::from_parts(
            Arc::new(SurrealRegistry::new(Arc::new(handle))),
            Arc::new(artifacts),
            config.registry_timeout(),
        ))
    }

    pub fn tracking(&self) -> Arc<dyn TrackingBackend> {
        self.tracking.clone()
    }

    pub fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        self.artifacts.clone()
    }

    pub fn recorder(&self) -> RunRecorder {
        RunRecorder::new(self.tracking(), self.artifacts(), self.timeout)
    }

    pub fn trainer(&self, config: &PipelineConfig) -> Trainer {
        Trainer::new(self.recorder(), config.clone())
    }

    pub fn policy(&self, metric_key: &str) -> PromotionPolicy {
        PromotionPolicy::new(self.tracking(), metric_key, self.timeout)
    }

    /// Executors from the same backend share promotion locks.
    pub fn executor(&self) -> StageExecutor {
        StageExecutor::with_locks(self.tracking(), self.locks.clone(), self.timeout)
    }

    pub fn loader(&self) -> ServingLoader {
        ServingLoader::new(self.tracking(), self.artifacts(), self.timeout)
    }
}
