//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryTracking` (experiments, runs, model registry) and
//! `MemoryArtifactStore` that satisfy the trait contracts without any
//! external dependencies. Both share a [`FaultPlan`] so tests can make
//! individual operations fail or stall.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// FaultPlan
// ---------------------------------------------------------------------------

/// Operation a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    GetExperiment,
    CreateExperiment,
    CreateRun,
    GetRun,
    RegisterVersion,
    ListVersions,
    SetStage,
    ArtifactPut,
    ArtifactGet,
}

#[derive(Debug)]
struct FaultRule {
    op: FaultOp,
    /// Calls that still succeed before the rule starts failing.
    skip: usize,
    /// Failures left; `None` fails forever.
    remaining: Option<usize>,
}

/// Scripted failures and latency for the in-memory fakes.
///
/// Injected failures surface as `StorageError::Unavailable`.
#[derive(Debug, Default)]
pub struct FaultPlan {
    rules: Mutex<Vec<FaultRule>>,
    latency: Mutex<Option<Duration>>,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call to `op` fails.
    pub fn fail_always(&self, op: FaultOp) {
        self.push(op, 0, None);
    }

    /// The next `times` calls to `op` fail.
    pub fn fail_times(&self, op: FaultOp, times: usize) {
        self.push(op, 0, Some(times));
    }

    /// Let `successes` calls to `op` through, then fail the next `times`.
    pub fn fail_after(&self, op: FaultOp, successes: usize, times: usize) {
        self.push(op, successes, Some(times));
    }

    /// Delay every operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *lock(&self.latency) = Some(latency);
    }

    /// Drop all rules and latency.
    pub fn clear(&self) {
        lock(&self.rules).clear();
        *lock(&self.latency) = None;
    }

    fn push(&self, op: FaultOp, skip: usize, remaining: Option<usize>) {
        lock(&self.rules).push(FaultRule {
            op,
            skip,
            remaining,
        });
    }

    async fn check(&self, op: FaultOp) -> StorageResult<()> {
        let latency = *lock(&self.latency);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut rules = lock(&self.rules);
        for rule in rules.iter_mut().filter(|r| r.op == op) {
            if rule.skip > 0 {
                rule.skip -= 1;
                continue;
            }
            match rule.remaining {
                Some(0) => continue,
                Some(ref mut n) => *n -= 1,
                None => {}
            }
            return Err(StorageError::Unavailable(format!(
                "injected fault on {:?}",
                op
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// In-memory artifact store backed by a `HashMap<digest, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
    faults: Arc<FaultPlan>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a fault plan with other fakes.
    pub fn with_faults(faults: Arc<FaultPlan>) -> Self {
        Self {
            store: Mutex::default(),
            faults,
        }
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    pub fn len(&self) -> usize {
        lock(&self.store).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        self.faults.check(FaultOp::ArtifactPut).await?;
        let digest = ContentDigest::from_bytes(data);
        lock(&self.store).insert(digest.as_str().to_string(), data.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        self.faults.check(FaultOp::ArtifactGet).await?;
        lock(&self.store)
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| StorageError::ArtifactNotFound {
                digest: digest.as_str().to_string(),
            })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        Ok(lock(&self.store).contains_key(digest.as_str()))
    }
}

// ---------------------------------------------------------------------------
// MemoryTracking
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct ModelEntry {
    last_version: u64,
    versions: Vec<ModelVersion>,
}

#[derive(Debug, Default)]
struct TrackingState {
    experiments: Vec<Experiment>,
    runs: HashMap<String, RunRecord>,
    models: HashMap<String, ModelEntry>,
}

/// In-memory experiments, runs and model registry.
#[derive(Debug, Default)]
pub struct MemoryTracking {
    state: Mutex<TrackingState>,
    faults: Arc<FaultPlan>,
}

impl MemoryTracking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share a fault plan with other fakes.
    pub fn with_faults(faults: Arc<FaultPlan>) -> Self {
        Self {
            state: Mutex::default(),
            faults,
        }
    }

    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Number of runs recorded so far.
    pub fn run_count(&self) -> usize {
        lock(&self.state).runs.len()
    }
}

#[async_trait]
impl ExperimentStore for MemoryTracking {
    async fn get_experiment_by_name(&self, name: &str) -> StorageResult<Option<Experiment>> {
        self.faults.check(FaultOp::GetExperiment).await?;
        let state = lock(&self.state);
        Ok(state.experiments.iter().find(|e| e.name == name).cloned())
    }

    async fn create_experiment(
        &self,
        name: &str,
        artifact_location: Option<&str>,
    ) -> StorageResult<Experiment> {
        self.faults.check(FaultOp::CreateExperiment).await?;
        let mut state = lock(&self.state);
        if state.experiments.iter().any(|e| e.name == name) {
            return Err(StorageError::Backend(format!(
                "experiment '{}' already exists",
                name
            )));
        }
        let experiment = Experiment {
            experiment_id: state.experiments.len().to_string(),
            name: name.to_string(),
            artifact_location: artifact_location.map(str::to_string),
        };
        state.experiments.push(experiment.clone());
        Ok(experiment)
    }
}

#[async_trait]
impl RunStore for MemoryTracking {
    async fn create_run(&self, draft: RunDraft) -> StorageResult<RunRecord> {
        self.faults.check(FaultOp::CreateRun).await?;
        let record = RunRecord {
            run_id: RunId::new(),
            experiment_id: draft.experiment_id,
            params: draft.params,
            metrics: draft.metrics,
            artifact: draft.artifact,
            created_at: Utc::now(),
        };
        lock(&self.state)
            .runs
            .insert(record.run_id.0.clone(), record.clone());
        Ok(record)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.faults.check(FaultOp::GetRun).await?;
        lock(&self.state)
            .runs
            .get(&run_id.0)
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }
}

#[async_trait]
impl ModelRegistry for MemoryTracking {
    async fn register_version(
        &self,
        name: &str,
        run_id: &RunId,
        source: Option<&ContentDigest>,
    ) -> StorageResult<ModelVersion> {
        self.faults.check(FaultOp::RegisterVersion).await?;
        let mut state = lock(&self.state);
        let entry = state.models.entry(name.to_string()).or_default();
        entry.last_version += 1;
        let version = ModelVersion {
            name: name.to_string(),
            version: entry.last_version,
            run_id: run_id.clone(),
            source: source.cloned(),
            stage: Stage::None,
            created_at: Utc::now(),
        };
        entry.versions.push(version.clone());
        Ok(version)
    }

    async fn list_versions(&self, name: &str) -> StorageResult<Vec<ModelVersion>> {
        self.faults.check(FaultOp::ListVersions).await?;
        let state = lock(&self.state);
        let mut versions = state
            .models
            .get(name)
            .map(|entry| entry.versions.clone())
            .unwrap_or_default();
        versions.sort_by_key(|v| v.version);
        Ok(versions)
    }

    async fn set_stage(
        &self,
        name: &str,
        version: u64,
        stage: Stage,
        archive_existing: bool,
    ) -> StorageResult<ModelVersion> {
        self.faults.check(FaultOp::SetStage).await?;
        let mut state = lock(&self.state);
        let not_found = || StorageError::VersionNotFound {
            name: name.to_string(),
            version,
        };
        let entry = state.models.get_mut(name).ok_or_else(not_found)?;
        if !entry.versions.iter().any(|v| v.version == version) {
            return Err(not_found());
        }

        let mut updated = None;
        for v in entry.versions.iter_mut() {
            if v.version == version {
                v.stage = stage;
                updated = Some(v.clone());
            } else if archive_existing && v.stage == stage {
                v.stage = Stage::Archived;
            }
        }
        updated.ok_or_else(not_found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fail_after_lets_calls_through_first() {
        let plan = FaultPlan::new();
        plan.fail_after(FaultOp::SetStage, 1, 1);

        assert!(plan.check(FaultOp::SetStage).await.is_ok());
        assert!(plan.check(FaultOp::SetStage).await.is_err());
        assert!(plan.check(FaultOp::SetStage).await.is_ok());
        assert!(plan.check(FaultOp::ListVersions).await.is_ok());
    }

    #[tokio::test]
    async fn fail_always_never_recovers() {
        let plan = FaultPlan::new();
        plan.fail_always(FaultOp::CreateRun);
        for _ in 0..3 {
            let err = plan.check(FaultOp::CreateRun).await.unwrap_err();
            assert!(err.is_unavailable());
        }
        plan.clear();
        assert!(plan.check(FaultOp::CreateRun).await.is_ok());
    }

    #[tokio::test]
    async fn archive_existing_only_touches_same_stage() {
        let tracking = MemoryTracking::new();
        let run = tracking.create_run(RunDraft::new(None)).await.unwrap();
        for _ in 0..3 {
            tracking
                .register_version("m", &run.run_id, None)
                .await
                .unwrap();
        }
        tracking.set_stage("m", 1, Stage::Production, false).await.unwrap();
        tracking.set_stage("m", 2, Stage::Staging, false).await.unwrap();
        tracking.set_stage("m", 3, Stage::Production, true).await.unwrap();

        let stages: Vec<Stage> = tracking
            .list_versions("m")
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.stage)
            .collect();
        assert_eq!(stages, vec![Stage::Archived, Stage::Staging, Stage::Production]);
    }
}
