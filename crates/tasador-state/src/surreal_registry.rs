//! SurrealDB-backed experiments, runs and model registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use surrealdb::sql::Datetime as SurrealDatetime;
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::StorageError;
use crate::handle::SurrealHandle;
use crate::storage_traits::{
    ContentDigest, Experiment, ExperimentStore, ModelRegistry, ModelVersion, ParamValue, RunDraft,
    RunId, RunRecord, RunStore, Stage, StorageResult,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbExperiment {
    experiment_id: String,
    name: String,
    artifact_location: Option<String>,
}

impl From<DbExperiment> for Experiment {
    fn from(row: DbExperiment) -> Self {
        Experiment {
            experiment_id: row.experiment_id,
            name: row.name,
            artifact_location: row.artifact_location,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbRun {
    run_id: String,
    experiment_id: Option<String>,
    params: BTreeMap<String, String>,
    metrics: BTreeMap<String, f64>,
    artifact: Option<String>,
    created_at: SurrealDatetime,
}

impl DbRun {
    fn into_record(self) -> StorageResult<RunRecord> {
        Ok(RunRecord {
            run_id: RunId(self.run_id),
            experiment_id: self.experiment_id,
            params: self
                .params
                .into_iter()
                .map(|(k, v)| (k, ParamValue::from_flat_string(&v)))
                .collect(),
            metrics: self.metrics,
            artifact: self.artifact.map(ContentDigest::try_from).transpose()?,
            created_at: DateTime::<Utc>::from(self.created_at),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DbModelVersion {
    name: String,
    version: u64,
    run_id: String,
    source: Option<String>,
    stage: String,
    created_at: SurrealDatetime,
}

impl DbModelVersion {
    fn into_version(self) -> StorageResult<ModelVersion> {
        Ok(ModelVersion {
            name: self.name,
            version: self.version,
            run_id: RunId(self.run_id),
            source: self.source.map(ContentDigest::try_from).transpose()?,
            stage: self.stage.parse()?,
            created_at: DateTime::<Utc>::from(self.created_at),
        })
    }
}

#[derive(Debug, Deserialize)]
struct VersionRow {
    version: u64,
}

/// SurrealDB implementation of the tracking traits.
#[derive(Clone)]
pub struct SurrealRegistry {
    handle: Arc<SurrealHandle>,
    /// Serializes version-number assignment within this process.
    register_lock: Arc<Mutex<()>>,
}

impl SurrealRegistry {
    pub fn new(handle: Arc<SurrealHandle>) -> Self {
        Self {
            handle,
            register_lock: Arc::new(Mutex::new(())),
        }
    }

    async fn select_version(&self, name: &str, version: u64) -> StorageResult<ModelVersion> {
        let mut result = self
            .handle
            .db()
            .query("SELECT * FROM model_versions WHERE name = $name AND version = $version")
            .bind(("name", name.to_string()))
            .bind(("version", version))
            .await?;

        let rows: Vec<DbModelVersion> = result.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::VersionNotFound {
                name: name.to_string(),
                version,
            })?
            .into_version()
    }
}

#[async_trait]
impl ExperimentStore for SurrealRegistry {
    #[instrument(skip(self))]
    async fn get_experiment_by_name(&self, name: &str) -> StorageResult<Option<Experiment>> {
        let mut result = self
            .handle
            .db()
            .query("SELECT * FROM experiments WHERE name = $name")
            .bind(("name", name.to_string()))
            .await?;

        let rows: Vec<DbExperiment> = result.take(0)?;
        Ok(rows.into_iter().next().map(Experiment::from))
    }

    #[instrument(skip(self))]
    async fn create_experiment(
        &self,
        name: &str,
        artifact_location: Option<&str>,
    ) -> StorageResult<Experiment> {
        let row = DbExperiment {
            experiment_id: uuid::Uuid::new_v4().simple().to_string(),
            name: name.to_string(),
            artifact_location: artifact_location.map(str::to_string),
        };

        let created: Option<DbExperiment> = self
            .handle
            .db()
            .create("experiments")
            .content(row)
            .await?;

        created
            .map(Experiment::from)
            .ok_or_else(|| StorageError::Backend("failed to create experiment".to_string()))
    }
}

#[async_trait]
impl RunStore for SurrealRegistry {
    #[instrument(skip(self, draft))]
    async fn create_run(&self, draft: RunDraft) -> StorageResult<RunRecord> {
        let row = DbRun {
            run_id: RunId::new().0,
            experiment_id: draft.experiment_id,
            params: draft
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_flat_string()))
                .collect(),
            metrics: draft.metrics,
            artifact: draft.artifact.map(String::from),
            created_at: SurrealDatetime::from(Utc::now()),
        };
        debug!(run_id = %row.run_id, "creating run");

        let created: Option<DbRun> = self.handle.db().create("runs").content(row).await?;
        created
            .ok_or_else(|| StorageError::Backend("failed to create run".to_string()))?
            .into_record()
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let mut result = self
            .handle
            .db()
            .query("SELECT * FROM runs WHERE run_id = $rid")
            .bind(("rid", run_id.0.clone()))
            .await?;

        let rows: Vec<DbRun> = result.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?
            .into_record()
    }
}

#[async_trait]
impl ModelRegistry for SurrealRegistry {
    #[instrument(skip(self, source), fields(run_id = %run_id))]
    async fn register_version(
        &self,
        name: &str,
        run_id: &RunId,
        source: Option<&ContentDigest>,
    ) -> StorageResult<ModelVersion> {
        let _guard = self.register_lock.lock().await;

        let mut result = self
            .handle
            .db()
            .query("SELECT version FROM model_versions WHERE name = $name ORDER BY version DESC LIMIT 1")
            .bind(("name", name.to_string()))
            .await?;
        let latest: Vec<VersionRow> = result.take(0)?;
        let next = latest.first().map(|r| r.version).unwrap_or(0) + 1;

        let row = DbModelVersion {
            name: name.to_string(),
            version: next,
            run_id: run_id.0.clone(),
            source: source.map(|d| d.as_str().to_string()),
            stage: Stage::None.as_str().to_string(),
            created_at: SurrealDatetime::from(Utc::now()),
        };

        let created: Option<DbModelVersion> = self
            .handle
            .db()
            .create("model_versions")
            .content(row)
            .await?;

        created
            .ok_or_else(|| StorageError::Backend("failed to register model version".to_string()))?
            .into_version()
    }

    #[instrument(skip(self))]
    async fn list_versions(&self, name: &str) -> StorageResult<Vec<ModelVersion>> {
        let mut result = self
            .handle
            .db()
            .query("SELECT * FROM model_versions WHERE name = $name ORDER BY version ASC")
            .bind(("name", name.to_string()))
            .await?;

        let rows: Vec<DbModelVersion> = result.take(0)?;
        rows.into_iter().map(DbModelVersion::into_version).collect()
    }

    #[instrument(skip(self))]
    async fn set_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        archive_existing: bool,
    ) -> StorageResult<ModelVersion> {
        // Existence check first so an unknown version never mutates siblings.
        self.select_version(name, version).await?;

        self.handle
            .db()
            .query("UPDATE model_versions SET stage = $stage WHERE name = $name AND version = $version")
            .bind(("stage", stage.as_str().to_string()))
            .bind(("name", name.to_string()))
            .bind(("version", version))
            .await?
            .check()?;

        if archive_existing {
            self.handle
                .db()
                .query(
                    "UPDATE model_versions SET stage = $archived \
                     WHERE name = $name AND stage = $stage AND version != $version",
                )
                .bind(("archived", Stage::Archived.as_str().to_string()))
                .bind(("stage", stage.as_str().to_string()))
                .bind(("name", name.to_string()))
                .bind(("version", version))
                .await?
                .check()?;
        }

        self.select_version(name, version).await
    }
}
