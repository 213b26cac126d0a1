use std::sync::Arc;
use std::time::Duration;

use tasador_core::{LinearModel, ServingLoader, TasadorError};
use tasador_state::fakes::{FaultOp, FaultPlan, MemoryArtifactStore, MemoryTracking};
use tasador_state::{ArtifactStore, ModelRegistry, RunDraft, RunStore, Stage};

const MODEL: &str = "real_estate_model";
const TIMEOUT: Duration = Duration::from_secs(5);

fn model(intercept: f64) -> LinearModel {
    LinearModel {
        features: vec!["bed".into(), "bath".into(), "house_size".into()],
        intercept,
        coefficients: vec![20000.0, 15000.0, 3000.0],
    }
}

struct Registry {
    faults: Arc<FaultPlan>,
    tracking: Arc<MemoryTracking>,
    artifacts: Arc<MemoryArtifactStore>,
}

impl Registry {
    fn new() -> Self {
        let faults = Arc::new(FaultPlan::new());
        Self {
            tracking: Arc::new(MemoryTracking::with_faults(faults.clone())),
            artifacts: Arc::new(MemoryArtifactStore::with_faults(faults.clone())),
            faults,
        }
    }

    async fn register(&self, artifact: Option<&LinearModel>) -> u64 {
        let digest = match artifact {
            Some(m) => Some(self.artifacts.put(&m.to_json_bytes().unwrap()).await.unwrap()),
            None => None,
        };
        let run = self.tracking.create_run(RunDraft::new(None)).await.unwrap();
        self.tracking
            .register_version(MODEL, &run.run_id, digest.as_ref())
            .await
            .unwrap()
            .version
    }

    fn loader(&self) -> ServingLoader {
        ServingLoader::new(self.tracking.clone(), self.artifacts.clone(), TIMEOUT)
    }
}

#[tokio::test]
async fn loads_production_version() {
    let registry = Registry::new();
    registry.register(Some(&model(1.0))).await;
    let v2 = registry.register(Some(&model(2.0))).await;
    registry
        .tracking
        .set_stage(MODEL, v2, Stage::Production, false)
        .await
        .unwrap();

    let holder = registry.loader().load_production(MODEL).await;
    let loaded = holder.current().expect("model loaded");
    assert_eq!(loaded.version, v2);
    assert_eq!(loaded.model, model(2.0));
    assert_eq!(
        holder.predict(&[3.0, 2.0, 100.0]).unwrap(),
        2.0 + 60000.0 + 30000.0 + 300000.0
    );
}

#[tokio::test]
async fn no_production_version_leaves_holder_empty() {
    let registry = Registry::new();
    registry.register(Some(&model(1.0))).await;

    let holder = registry.loader().load_production(MODEL).await;
    assert!(holder.current().is_none());
    assert!(matches!(
        holder.predict(&[1.0, 1.0, 50.0]),
        Err(TasadorError::ModelUnavailable(_))
    ));
}

#[tokio::test]
async fn production_without_artifact_leaves_holder_empty() {
    let registry = Registry::new();
    let v = registry.register(None).await;
    registry
        .tracking
        .set_stage(MODEL, v, Stage::Production, false)
        .await
        .unwrap();

    assert!(!registry.loader().load_production(MODEL).await.is_loaded());
}

#[tokio::test]
async fn artifact_fetch_failure_leaves_holder_empty() {
    let registry = Registry::new();
    let v = registry.register(Some(&model(1.0))).await;
    registry
        .tracking
        .set_stage(MODEL, v, Stage::Production, false)
        .await
        .unwrap();
    registry.faults.fail_always(FaultOp::ArtifactGet);

    assert!(!registry.loader().load_production(MODEL).await.is_loaded());
}

#[tokio::test]
async fn unreachable_registry_leaves_holder_empty() {
    let registry = Registry::new();
    registry.faults.fail_always(FaultOp::ListVersions);

    assert!(!registry.loader().load_production(MODEL).await.is_loaded());
}

#[tokio::test]
async fn corrupt_artifact_leaves_holder_empty() {
    let registry = Registry::new();
    let digest = registry.artifacts.put(b"not a model").await.unwrap();
    let run = registry.tracking.create_run(RunDraft::new(None)).await.unwrap();
    registry
        .tracking
        .register_version(MODEL, &run.run_id, Some(&digest))
        .await
        .unwrap();
    registry
        .tracking
        .set_stage(MODEL, 1, Stage::Production, false)
        .await
        .unwrap();

    assert!(!registry.loader().load_production(MODEL).await.is_loaded());
}

#[tokio::test]
async fn two_production_versions_load_the_highest() {
    let registry = Registry::new();
    let v1 = registry.register(Some(&model(1.0))).await;
    let v2 = registry.register(Some(&model(2.0))).await;
    for v in [v1, v2] {
        registry
            .tracking
            .set_stage(MODEL, v, Stage::Production, false)
            .await
            .unwrap();
    }

    let holder = registry.loader().load_production(MODEL).await;
    assert_eq!(holder.current().map(|m| m.version), Some(v2));
}
