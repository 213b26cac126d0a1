//! MLflow tracking server backend.
//!
//! Talks to the REST API under `/api/2.0/mlflow/` for experiments, runs and
//! the model registry, and to the artifact proxy under
//! `/api/2.0/mlflow-artifacts/artifacts/` for model blobs. Every request is
//! bounded by the client timeout; connection failures and timeouts map to
//! `StorageError::Unavailable`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, instrument, warn};

use crate::error::StorageError;
use crate::storage_traits::{
    ArtifactStore, ContentDigest, Experiment, ExperimentStore, ModelRegistry, ModelVersion,
    ParamValue, RunDraft, RunId, RunRecord, RunStore, Stage, StorageResult,
};

/// Experiment id MLflow uses for runs created without an explicit experiment
pub const DEFAULT_EXPERIMENT_ID: &str = "0";

const ARTIFACT_PREFIX: &str = "tasador/models";
const SEARCH_PAGE_SIZE: u32 = 200;

/// MLflow client settings
#[derive(Debug, Clone)]
pub struct MlflowConfig {
    /// Tracking server base URL (e.g. "http://mlflow:5000")
    pub tracking_uri: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl MlflowConfig {
    pub fn new(tracking_uri: impl Into<String>) -> Self {
        Self {
            tracking_uri: tracking_uri.into(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

impl ApiError {
    /// Parse an error body; anything that is not MLflow's JSON becomes the message.
    async fn read(response: reqwest::Response) -> Self {
        let body = response.text().await.unwrap_or_default();
        serde_json::from_str::<ApiError>(&body).unwrap_or(ApiError {
            error_code: String::new(),
            message: body,
        })
    }
}

#[derive(Debug, Deserialize)]
struct WireExperiment {
    experiment_id: String,
    name: String,
    #[serde(default)]
    artifact_location: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GetExperimentResponse {
    experiment: WireExperiment,
}

#[derive(Debug, Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Debug, Deserialize)]
struct WireKeyValue {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct WireMetric {
    key: String,
    value: f64,
}

#[derive(Debug, Deserialize)]
struct WireRunInfo {
    run_id: String,
    #[serde(default)]
    experiment_id: Option<String>,
    #[serde(default)]
    start_time: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct WireRunData {
    #[serde(default)]
    metrics: Vec<WireMetric>,
    #[serde(default)]
    params: Vec<WireKeyValue>,
    #[serde(default)]
    tags: Vec<WireKeyValue>,
}

#[derive(Debug, Deserialize)]
struct WireRun {
    info: WireRunInfo,
    #[serde(default)]
    data: WireRunData,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: WireRun,
}

#[derive(Debug, Deserialize)]
struct WireModelVersion {
    name: String,
    version: String,
    #[serde(default)]
    creation_timestamp: Option<i64>,
    #[serde(default)]
    current_stage: Option<String>,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelVersionResponse {
    model_version: WireModelVersion,
}

#[derive(Debug, Deserialize)]
struct SearchVersionsResponse {
    #[serde(default)]
    model_versions: Vec<WireModelVersion>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Serialize)]
struct LogBatch<'a> {
    run_id: &'a str,
    metrics: Vec<serde_json::Value>,
    params: Vec<serde_json::Value>,
    tags: Vec<serde_json::Value>,
}

const ARTIFACT_TAG: &str = "tasador.artifact_digest";

fn millis_to_utc(ms: Option<i64>) -> DateTime<Utc> {
    ms.and_then(DateTime::<Utc>::from_timestamp_millis)
        .unwrap_or_else(Utc::now)
}

/// Digest of a model version's source URI, when it points into our prefix.
fn digest_from_source(source: &str) -> Option<ContentDigest> {
    let last = source.trim_end_matches('/').rsplit('/').next()?;
    ContentDigest::try_from(last.to_string()).ok()
}

impl WireModelVersion {
    fn into_version(self) -> StorageResult<ModelVersion> {
        let version = self.version.parse::<u64>().map_err(|_| {
            StorageError::Serialization(format!("non-numeric model version '{}'", self.version))
        })?;
        let stage = match self.current_stage.as_deref() {
            Some(label) => label.parse()?,
            None => Stage::None,
        };
        Ok(ModelVersion {
            name: self.name,
            version,
            run_id: RunId(self.run_id.unwrap_or_default()),
            source: self.source.as_deref().and_then(digest_from_source),
            stage,
            created_at: millis_to_utc(self.creation_timestamp),
        })
    }
}

impl WireRun {
    fn into_record(self) -> RunRecord {
        let artifact = self
            .data
            .tags
            .iter()
            .find(|t| t.key == ARTIFACT_TAG)
            .and_then(|t| ContentDigest::try_from(t.value.clone()).ok());
        RunRecord {
            run_id: RunId(self.info.run_id),
            experiment_id: self.info.experiment_id,
            params: self
                .data
                .params
                .into_iter()
                .map(|p| (p.key, ParamValue::from_flat_string(&p.value)))
                .collect(),
            metrics: self
                .data
                .metrics
                .into_iter()
                .map(|m| (m.key, m.value))
                .collect::<BTreeMap<_, _>>(),
            artifact,
            created_at: millis_to_utc(self.info.start_time),
        }
    }
}

/// REST client for an MLflow tracking server.
#[derive(Debug, Clone)]
pub struct MlflowClient {
    base: String,
    http: reqwest::Client,
}

impl MlflowClient {
    pub fn new(config: MlflowConfig) -> StorageResult<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("tasador/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()
            .map_err(|e| StorageError::Backend(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base: config.tracking_uri.trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn tracking_uri(&self) -> &str {
        &self.base
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/2.0/mlflow/{}", self.base, path)
    }

    fn artifact_url(&self, digest: &ContentDigest) -> String {
        format!(
            "{}/api/2.0/mlflow-artifacts/artifacts/{}/{}",
            self.base,
            ARTIFACT_PREFIX,
            digest.as_str()
        )
    }

    fn artifact_source(digest: &ContentDigest) -> String {
        format!("mlflow-artifacts:/{}/{}", ARTIFACT_PREFIX, digest.as_str())
    }

    /// Send a request; `Ok(None)` means the server answered RESOURCE_DOES_NOT_EXIST.
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> StorageResult<Option<T>> {
        let response = request.send().await?;
        let status = response.status();

        if status.is_success() {
            return Ok(Some(response.json::<T>().await?));
        }

        let api_error = ApiError::read(response).await;

        if status == StatusCode::NOT_FOUND || api_error.error_code == "RESOURCE_DOES_NOT_EXIST" {
            return Ok(None);
        }

        let detail = format!("{} {}: {}", status, api_error.error_code, api_error.message);
        if status.is_server_error() {
            Err(StorageError::Unavailable(detail))
        } else {
            Err(StorageError::Backend(detail))
        }
    }

    async fn ensure_registered_model(&self, name: &str) -> StorageResult<()> {
        let response = self
            .http
            .post(self.api("registered-models/create"))
            .json(&json!({ "name": name }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let api_error = ApiError::read(response).await;
        if api_error.error_code == "RESOURCE_ALREADY_EXISTS" {
            debug!(model = %name, "registered model already exists");
            return Ok(());
        }
        let detail = format!(
            "failed to create registered model '{}': {} {}: {}",
            name, status, api_error.error_code, api_error.message
        );
        Err(if status.is_server_error() {
            StorageError::Unavailable(detail)
        } else {
            StorageError::Backend(detail)
        })
    }

    /// Like `send`, but a missing resource is an error.
    async fn send_required<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        what: &str,
    ) -> StorageResult<T> {
        self.send(request)
            .await?
            .ok_or_else(|| StorageError::Backend(format!("{} returned 404", what)))
    }

    /// Log params, metrics and the artifact tag, then close the run.
    async fn finish_run(&self, run_id: &str, draft: &RunDraft, now: i64) -> StorageResult<()> {
        let batch = LogBatch {
            run_id,
            metrics: draft
                .metrics
                .iter()
                .map(|(k, v)| json!({ "key": k, "value": v, "timestamp": now, "step": 0 }))
                .collect(),
            params: draft
                .params
                .iter()
                .map(|(k, v)| json!({ "key": k, "value": v.to_flat_string() }))
                .collect(),
            tags: draft
                .artifact
                .iter()
                .map(|d| json!({ "key": ARTIFACT_TAG, "value": d.as_str() }))
                .collect(),
        };
        let request = self.http.post(self.api("runs/log-batch")).json(&batch);
        let _: Empty = self.send_required(request, "runs/log-batch").await?;

        let request = self.http.post(self.api("runs/update")).json(&json!({
            "run_id": run_id,
            "status": "FINISHED",
            "end_time": Utc::now().timestamp_millis(),
        }));
        let _: serde_json::Value = self.send_required(request, "runs/update").await?;
        Ok(())
    }

    /// Remove a run whose data could not be logged.
    async fn discard_run(&self, run_id: &str) {
        let request = self
            .http
            .post(self.api("runs/delete"))
            .json(&json!({ "run_id": run_id }));
        if let Err(e) = self.send_required::<Empty>(request, "runs/delete").await {
            warn!(run_id = %run_id, error = %e, "incomplete run could not be deleted");
        }
    }
}

#[async_trait]
impl ExperimentStore for MlflowClient {
    #[instrument(skip(self))]
    async fn get_experiment_by_name(&self, name: &str) -> StorageResult<Option<Experiment>> {
        let request = self
            .http
            .get(self.api("experiments/get-by-name"))
            .query(&[("experiment_name", name)]);
        let response: Option<GetExperimentResponse> = self.send(request).await?;
        Ok(response.map(|r| Experiment {
            experiment_id: r.experiment.experiment_id,
            name: r.experiment.name,
            artifact_location: r.experiment.artifact_location,
        }))
    }

    #[instrument(skip(self))]
    async fn create_experiment(
        &self,
        name: &str,
        artifact_location: Option<&str>,
    ) -> StorageResult<Experiment> {
        let mut body = json!({ "name": name });
        if let Some(location) = artifact_location {
            body["artifact_location"] = json!(location);
        }
        let request = self.http.post(self.api("experiments/create")).json(&body);
        let created: CreateExperimentResponse = self
            .send(request)
            .await?
            .ok_or_else(|| StorageError::Backend("experiment create returned 404".to_string()))?;

        Ok(Experiment {
            experiment_id: created.experiment_id,
            name: name.to_string(),
            artifact_location: artifact_location.map(str::to_string),
        })
    }
}

#[async_trait]
impl RunStore for MlflowClient {
    #[instrument(skip(self, draft))]
    async fn create_run(&self, draft: RunDraft) -> StorageResult<RunRecord> {
        let experiment_id = draft
            .experiment_id
            .clone()
            .unwrap_or_else(|| DEFAULT_EXPERIMENT_ID.to_string());
        let now = Utc::now().timestamp_millis();

        let request = self.http.post(self.api("runs/create")).json(&json!({
            "experiment_id": experiment_id,
            "start_time": now,
        }));
        let created: RunResponse = self
            .send(request)
            .await?
            .ok_or_else(|| StorageError::Backend("run create returned 404".to_string()))?;
        let run_id = created.run.info.run_id.clone();

        if let Err(e) = self.finish_run(&run_id, &draft, now).await {
            self.discard_run(&run_id).await;
            return Err(e);
        }

        Ok(RunRecord {
            run_id: RunId(run_id),
            experiment_id: Some(experiment_id),
            params: draft.params,
            metrics: draft.metrics,
            artifact: draft.artifact,
            created_at: millis_to_utc(Some(now)),
        })
    }

    #[instrument(skip(self), fields(run_id = %run_id))]
    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let request = self
            .http
            .get(self.api("runs/get"))
            .query(&[("run_id", run_id.0.as_str())]);
        let response: RunResponse =
            self.send(request)
                .await?
                .ok_or_else(|| StorageError::RunNotFound {
                    run_id: run_id.0.clone(),
                })?;
        Ok(response.run.into_record())
    }
}

#[async_trait]
impl ModelRegistry for MlflowClient {
    #[instrument(skip(self, source), fields(run_id = %run_id))]
    async fn register_version(
        &self,
        name: &str,
        run_id: &RunId,
        source: Option<&ContentDigest>,
    ) -> StorageResult<ModelVersion> {
        self.ensure_registered_model(name).await?;

        let mut body = json!({ "name": name, "run_id": run_id.0 });
        if let Some(digest) = source {
            body["source"] = json!(Self::artifact_source(digest));
        }
        let request = self.http.post(self.api("model-versions/create")).json(&body);
        let created: ModelVersionResponse = self.send(request).await?.ok_or_else(|| {
            StorageError::ModelNotFound {
                name: name.to_string(),
            }
        })?;
        created.model_version.into_version()
    }

    #[instrument(skip(self))]
    async fn list_versions(&self, name: &str) -> StorageResult<Vec<ModelVersion>> {
        let filter = format!("name='{}'", name.replace('\'', "\\'"));
        let mut versions = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("filter", filter.clone()),
                ("max_results", SEARCH_PAGE_SIZE.to_string()),
            ];
            if let Some(token) = &page_token {
                query.push(("page_token", token.clone()));
            }
            let request = self
                .http
                .get(self.api("model-versions/search"))
                .query(&query);
            let page: SearchVersionsResponse = match self.send(request).await? {
                Some(page) => page,
                None => break,
            };
            for wire in page.model_versions {
                versions.push(wire.into_version()?);
            }
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    #[instrument(skip(self))]
    async fn set_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        archive_existing: bool,
    ) -> StorageResult<ModelVersion> {
        let request = self
            .http
            .post(self.api("model-versions/transition-stage"))
            .json(&json!({
                "name": name,
                "version": version.to_string(),
                "stage": stage.as_str(),
                "archive_existing_versions": archive_existing,
            }));
        let response: ModelVersionResponse =
            self.send(request)
                .await?
                .ok_or_else(|| StorageError::VersionNotFound {
                    name: name.to_string(),
                    version,
                })?;
        response.model_version.into_version()
    }
}

#[async_trait]
impl ArtifactStore for MlflowClient {
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        let response = self
            .http
            .put(self.artifact_url(&digest))
            .body(data.to_vec())
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "artifact upload rejected");
            let detail = format!("artifact upload failed ({}): {}", status, body);
            return Err(if status.is_server_error() {
                StorageError::Unavailable(detail)
            } else {
                StorageError::Backend(detail)
            });
        }
        Ok(digest)
    }

    #[instrument(skip(self), fields(digest = %digest.short()))]
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        let response = self.http.get(self.artifact_url(digest)).send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(StorageError::ArtifactNotFound {
                digest: digest.as_str().to_string(),
            });
        }
        if !status.is_success() {
            let detail = format!("artifact download failed ({})", status);
            return Err(if status.is_server_error() {
                StorageError::Unavailable(detail)
            } else {
                StorageError::Backend(detail)
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        match self.get(digest).await {
            Ok(_) => Ok(true),
            Err(StorageError::ArtifactNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let client = MlflowClient::new(MlflowConfig::new("http://mlflow:5000/")).unwrap();
        assert_eq!(client.tracking_uri(), "http://mlflow:5000");
        assert_eq!(
            client.api("runs/get"),
            "http://mlflow:5000/api/2.0/mlflow/runs/get"
        );
    }

    #[test]
    fn source_uri_round_trips_digest() {
        let digest = ContentDigest::from_bytes(b"artifact");
        let source = MlflowClient::artifact_source(&digest);
        assert!(source.starts_with("mlflow-artifacts:/tasador/models/"));
        assert_eq!(digest_from_source(&source), Some(digest));
        assert_eq!(digest_from_source("s3://bucket/0/abc/artifacts/model"), None);
    }

    #[test]
    fn wire_version_parses_registry_payload() {
        let payload = r#"{
            "model_version": {
                "name": "real_estate_model",
                "version": "3",
                "creation_timestamp": 1704067200000,
                "current_stage": "Production",
                "run_id": "abc",
                "source": "s3://mlflow-artifacts/1/abc/artifacts/model"
            }
        }"#;
        let parsed: ModelVersionResponse = serde_json::from_str(payload).unwrap();
        let version = parsed.model_version.into_version().unwrap();
        assert_eq!(version.version, 3);
        assert_eq!(version.stage, Stage::Production);
        assert_eq!(version.run_id, RunId("abc".to_string()));
        assert!(version.source.is_none());
    }

    #[test]
    fn wire_run_collects_metrics_params_and_artifact_tag() {
        let digest = ContentDigest::from_bytes(b"m");
        let payload = json!({
            "run": {
                "info": { "run_id": "r1", "experiment_id": "2", "start_time": 1704067200000i64 },
                "data": {
                    "metrics": [{ "key": "r2_score", "value": 0.85, "timestamp": 1, "step": 0 }],
                    "params": [{ "key": "features", "value": "[\"bed\",\"bath\",\"house_size\"]" }],
                    "tags": [{ "key": ARTIFACT_TAG, "value": digest.as_str() }]
                }
            }
        });
        let parsed: RunResponse = serde_json::from_value(payload).unwrap();
        let record = parsed.run.into_record();
        assert_eq!(record.metric("r2_score"), Some(0.85));
        assert_eq!(record.artifact, Some(digest));
        assert!(matches!(
            record.params.get("features"),
            Some(ParamValue::List(items)) if items.len() == 3
        ));
    }

    #[tokio::test]
    async fn unreachable_server_is_unavailable() {
        let client = MlflowClient::new(
            MlflowConfig::new("http://127.0.0.1:9").with_timeout(Duration::from_millis(500)),
        )
        .unwrap();
        let err = client.list_versions("m").await.unwrap_err();
        assert!(err.is_unavailable(), "unexpected error: {err:?}");
    }
}
