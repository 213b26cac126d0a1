//! Run recording against the tracking backend.
//!
//! `record_run` persists exactly one immutable run. `log_model` adds the
//! artifact upload and version registration on top, falling back to a
//! metrics-only run when the artifact path fails.

use std::sync::Arc;
use std::time::Duration;

use tasador_state::{
    ArtifactStore, Experiment, ModelVersion, RunDraft, RunId, RunRecord, TrackingBackend,
};
use tracing::debug;

use crate::deadline::bounded;
use crate::error::{Result, TasadorError};
use crate::metrics::METRICS;
use crate::obs;

/// A run plus whatever model registration happened alongside it.
#[derive(Debug)]
pub struct LoggedRun {
    pub run: RunRecord,
    /// Registered version, `None` when the run fell back to metrics only
    pub version: Option<ModelVersion>,
    /// Non-fatal failures that were recovered on the way
    pub recovered: Vec<TasadorError>,
}

impl LoggedRun {
    pub fn is_metrics_only(&self) -> bool {
        self.version.is_none()
    }
}

#[derive(Clone)]
pub struct RunRecorder {
    tracking: Arc<dyn TrackingBackend>,
    artifacts: Arc<dyn ArtifactStore>,
    timeout: Duration,
}

impl RunRecorder {
    pub fn new(
        tracking: Arc<dyn TrackingBackend>,
        artifacts: Arc<dyn ArtifactStore>,
        timeout: Duration,
    ) -> Self {
        Self {
            tracking,
            artifacts,
            timeout,
        }
    }

    /// Persist one run. Fails with `RegistryUnavailable` when the store
    /// cannot be reached.
    pub async fn record_run(&self, draft: RunDraft) -> Result<RunId> {
        Ok(self.create(draft).await?.run_id)
    }

    async fn create(&self, draft: RunDraft) -> Result<RunRecord> {
        let with_artifact = draft.artifact.is_some();
        let run = bounded(self.timeout, "create_run", self.tracking.create_run(draft)).await?;
        METRICS.inc_runs_recorded();
        obs::emit_run_recorded(&run.run_id.0, run.metrics.len(), with_artifact);
        Ok(run)
    }

    /// Look up or create the experiment. Any failure is reported as
    /// `ExperimentSetupFailed`; callers decide whether to continue.
    pub async fn setup_experiment(
        &self,
        name: &str,
        artifact_location: Option<&str>,
    ) -> Result<Experiment> {
        bounded(
            self.timeout,
            "get_or_create_experiment",
            self.tracking.get_or_create_experiment(name, artifact_location),
        )
        .await
        .map_err(|e| TasadorError::ExperimentSetupFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    /// Upload `artifact`, record the run and register it under `model_name`.
    ///
    /// Artifact upload or registration failures degrade to a metrics-only
    /// run (`ModelLoggingFailed` in `recovered`). Only a failure to record
    /// the metrics-only run itself is returned as an error.
    pub async fn log_model(
        &self,
        model_name: &str,
        draft: RunDraft,
        artifact: &[u8],
    ) -> Result<LoggedRun> {
        let mut recovered = Vec::new();
        let fallback = |recovered: &mut Vec<TasadorError>, reason: String| {
            let err = TasadorError::ModelLoggingFailed(reason);
            obs::emit_model_logging_fallback(model_name, &err);
            METRICS.inc_logging_fallbacks();
            recovered.push(err);
        };

        let digest = match bounded(self.timeout, "artifact_put", self.artifacts.put(artifact)).await
        {
            Ok(digest) => Some(digest),
            Err(e) => {
                fallback(&mut recovered, format!("artifact upload failed: {}", e));
                None
            }
        };

        let run = match digest {
            Some(digest) => match self.create(draft.clone().artifact(digest)).await {
                Ok(run) => run,
                Err(e) => {
                    fallback(&mut recovered, format!("run with artifact not recorded: {}", e));
                    self.create(draft.metrics_only()).await?
                }
            },
            None => self.create(draft.metrics_only()).await?,
        };

        let version = match &run.artifact {
            Some(digest) => match bounded(
                self.timeout,
                "register_version",
                self.tracking
                    .register_version(model_name, &run.run_id, Some(digest)),
            )
            .await
            {
                Ok(version) => {
                    debug!(model = %model_name, version = version.version, "version registered");
                    Some(version)
                }
                Err(e) => {
                    fallback(&mut recovered, format!("version registration failed: {}", e));
                    None
                }
            },
            None => None,
        };

        Ok(LoggedRun {
            run,
            version,
            recovered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tasador_state::fakes::{FaultOp, FaultPlan, MemoryArtifactStore, MemoryTracking};
    use tasador_state::{ModelRegistry, RunStore};

    struct Fixture {
        faults: Arc<FaultPlan>,
        tracking: Arc<MemoryTracking>,
        artifacts: Arc<MemoryArtifactStore>,
        recorder: RunRecorder,
    }

    fn fixture() -> Fixture {
        let faults = Arc::new(FaultPlan::new());
        let tracking = Arc::new(MemoryTracking::with_faults(faults.clone()));
        let artifacts = Arc::new(MemoryArtifactStore::with_faults(faults.clone()));
        let recorder = RunRecorder::new(tracking.clone(), artifacts.clone(), Duration::from_secs(5));
        Fixture {
            faults,
            tracking,
            artifacts,
            recorder,
        }
    }

    fn draft() -> RunDraft {
        RunDraft::new(None)
            .param(
                "features",
                vec!["bed".to_string(), "bath".to_string(), "house_size".to_string()],
            )
            .metric("r2_score", 0.8)
    }

    #[tokio::test]
    async fn record_run_persists_once() {
        let fx = fixture();
        let run_id = fx.recorder.record_run(draft()).await.unwrap();
        let stored = fx.tracking.get_run(&run_id).await.unwrap();
        assert_eq!(stored.metric("r2_score"), Some(0.8));
        assert_eq!(fx.tracking.run_count(), 1);
    }

    #[tokio::test]
    async fn record_run_unreachable_is_registry_unavailable() {
        let fx = fixture();
        fx.faults.fail_always(FaultOp::CreateRun);
        let err = fx.recorder.record_run(draft()).await.unwrap_err();
        assert!(matches!(err, TasadorError::RegistryUnavailable(_)));
    }

    #[tokio::test]
    async fn log_model_registers_version_with_artifact() {
        let fx = fixture();
        let logged = fx.recorder.log_model("m", draft(), b"{}").await.unwrap();
        assert!(logged.recovered.is_empty());
        let version = logged.version.unwrap();
        assert_eq!(version.version, 1);
        assert_eq!(version.run_id, logged.run.run_id);
        assert!(logged.run.artifact.is_some());
        assert_eq!(fx.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn artifact_failure_falls_back_to_metrics_only() {
        let fx = fixture();
        fx.faults.fail_always(FaultOp::ArtifactPut);

        let logged = fx.recorder.log_model("m", draft(), b"{}").await.unwrap();
        assert!(logged.is_metrics_only());
        assert!(logged.run.artifact.is_none());
        assert_eq!(logged.run.metric("r2_score"), Some(0.8));
        assert!(matches!(
            logged.recovered.as_slice(),
            [TasadorError::ModelLoggingFailed(_)]
        ));
        assert!(fx.tracking.list_versions("m").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn registration_failure_keeps_the_run() {
        let fx = fixture();
        fx.faults.fail_always(FaultOp::RegisterVersion);

        let logged = fx.recorder.log_model("m", draft(), b"{}").await.unwrap();
        assert!(logged.is_metrics_only());
        assert_eq!(fx.tracking.run_count(), 1);
        assert_eq!(logged.recovered.len(), 1);
    }

    #[tokio::test]
    async fn failed_run_with_artifact_retries_metrics_only() {
        let fx = fixture();
        fx.faults.fail_times(FaultOp::CreateRun, 1);

        let logged = fx.recorder.log_model("m", draft(), b"{}").await.unwrap();
        assert!(logged.is_metrics_only());
        assert!(logged.run.artifact.is_none());
        assert_eq!(fx.tracking.run_count(), 1);
    }

    #[tokio::test]
    async fn fallback_failure_escalates() {
        let fx = fixture();
        fx.faults.fail_always(FaultOp::ArtifactPut);
        fx.faults.fail_always(FaultOp::CreateRun);

        let err = fx.recorder.log_model("m", draft(), b"{}").await.unwrap_err();
        assert!(matches!(err, TasadorError::RegistryUnavailable(_)));
        assert_eq!(fx.tracking.run_count(), 0);
    }

    #[tokio::test]
    async fn experiment_failure_is_experiment_setup_failed() {
        let fx = fixture();
        fx.faults.fail_always(FaultOp::GetExperiment);
        let err = fx
            .recorder
            .setup_experiment("real_estate_exp", None)
            .await
            .unwrap_err();
        assert!(matches!(err, TasadorError::ExperimentSetupFailed { ref name, .. } if name == "real_estate_exp"));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_registry_times_out() {
        let faults = Arc::new(FaultPlan::new());
        faults.set_latency(Duration::from_secs(60));
        let tracking = Arc::new(MemoryTracking::with_faults(faults.clone()));
        let recorder = RunRecorder::new(
            tracking,
            Arc::new(MemoryArtifactStore::new()),
            Duration::from_secs(1),
        );
        let err = recorder.record_run(draft()).await.unwrap_err();
        assert!(matches!(err, TasadorError::RegistryUnavailable(ref msg) if msg.contains("timed out")));
    }
}
