//! Ingest → process → train → promote → load, end to end on the in-memory
//! backend.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tasador_core::{
    ingest, process, promote_best, Backend, DatasetError, PipelineConfig, TasadorError,
};
use tasador_state::fakes::{FaultOp, FaultPlan, MemoryArtifactStore, MemoryTracking};
use tasador_state::{ExperimentStore, ModelRegistry, ParamValue, RunStore, Stage};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Synthetic listings with a known linear price.
fn write_listings(dir: &Path, rows: usize) -> PathBuf {
    let mut body = String::from("brokered_by,status,price,bed,bath,acre_lot,city,house_size\n");
    for i in 0..rows {
        let bed = 1 + i % 6;
        let bath = 1 + i % 4;
        let size = 50 + (i * 37) % 450;
        let price = 20000 * bed + 15000 * bath + 2800 * size + 40000;
        body.push_str(&format!(
            "Compass,lista para la venta,{},{},{},0.5,Madrid,{}\n",
            price, bed, bath, size
        ));
    }
    let path = dir.join("properties_batch.csv");
    std::fs::write(&path, body).unwrap();
    path
}

fn config(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        raw_data: dir.join("properties_batch.csv"),
        processed_data: dir.join("processed_properties.csv"),
        seed: Some(42),
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn full_flow_trains_promotes_and_serves() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_listings(dir.path(), 60);

    let ingested = ingest(&cfg.raw_data).unwrap();
    assert_eq!(ingested.rows, 60);
    process(&cfg.raw_data, &cfg.processed_data).unwrap();

    let backend = Backend::in_memory(TIMEOUT);
    let report = backend.trainer(&cfg).train(&cfg.processed_data).await.unwrap();
    assert!(report.recovered.is_empty());
    assert_eq!(report.version, Some(1));
    assert!(report.score > 0.999, "score {}", report.score);

    let run = backend.tracking().get_run(&report.run_id).await.unwrap();
    assert_eq!(
        run.params.get("features"),
        Some(&ParamValue::List(cfg.features.clone()))
    );
    assert_eq!(run.metric("r2_score"), Some(report.score));
    assert_eq!(run.experiment_id, report.experiment_id);

    let experiment = backend
        .tracking()
        .get_experiment_by_name("real_estate_exp")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        experiment.artifact_location.as_deref(),
        Some("s3://mlflow-artifacts/experiments/")
    );

    let (_, promoted) = promote_best(&backend.policy(&cfg.metric_key), &backend.executor(), &cfg.model_name)
        .await
        .unwrap();
    assert_eq!(promoted.version, 1);

    let holder = backend.loader().load_production(&cfg.model_name).await;
    let price = holder.predict(&[3.0, 2.0, 120.0]).unwrap();
    let expected = 20000.0 * 3.0 + 15000.0 * 2.0 + 2800.0 * 120.0 + 40000.0;
    assert!((price - expected).abs() < 1.0, "{price} vs {expected}");
}

#[tokio::test]
async fn second_training_run_adds_a_version() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_listings(dir.path(), 40);
    process(&cfg.raw_data, &cfg.processed_data).unwrap();

    let backend = Backend::in_memory(TIMEOUT);
    let trainer = backend.trainer(&cfg);
    trainer.train(&cfg.processed_data).await.unwrap();
    let second = trainer.train(&cfg.processed_data).await.unwrap();
    assert_eq!(second.version, Some(2));

    let versions = backend.tracking().list_versions(&cfg.model_name).await.unwrap();
    assert!(versions.iter().all(|v| v.stage == Stage::None));
}

#[tokio::test]
async fn experiment_failure_continues_without_experiment() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_listings(dir.path(), 40);
    process(&cfg.raw_data, &cfg.processed_data).unwrap();

    let faults = Arc::new(FaultPlan::new());
    faults.fail_always(FaultOp::GetExperiment);
    let backend = Backend::from_parts(
        Arc::new(MemoryTracking::with_faults(faults.clone())),
        Arc::new(MemoryArtifactStore::with_faults(faults)),
        TIMEOUT,
    );

    let report = backend.trainer(&cfg).train(&cfg.processed_data).await.unwrap();
    assert!(report.experiment_id.is_none());
    assert_eq!(report.version, Some(1));
    assert!(matches!(
        report.recovered.as_slice(),
        [TasadorError::ExperimentSetupFailed { .. }]
    ));
}

#[tokio::test]
async fn artifact_failure_yields_metrics_only_run() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_listings(dir.path(), 40);
    process(&cfg.raw_data, &cfg.processed_data).unwrap();

    let faults = Arc::new(FaultPlan::new());
    faults.fail_always(FaultOp::ArtifactPut);
    let backend = Backend::from_parts(
        Arc::new(MemoryTracking::with_faults(faults.clone())),
        Arc::new(MemoryArtifactStore::with_faults(faults)),
        TIMEOUT,
    );

    let report = backend.trainer(&cfg).train(&cfg.processed_data).await.unwrap();
    assert!(report.version.is_none());
    let run = backend.tracking().get_run(&report.run_id).await.unwrap();
    assert!(run.artifact.is_none());
    assert!(run.metric("r2_score").is_some());
}

#[tokio::test]
async fn unprocessed_dataset_fails_precondition() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let raw = write_listings(dir.path(), 40);

    let backend = Backend::in_memory(TIMEOUT);
    let err = backend.trainer(&cfg).train(&raw).await.unwrap_err();
    assert!(matches!(
        err,
        TasadorError::Dataset(DatasetError::MissingColumn(ref c)) if c == "price_m2"
    ));
    assert!(backend
        .tracking()
        .list_versions(&cfg.model_name)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn surreal_backend_runs_the_same_flow() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.backend.kind = tasador_core::BackendKind::Surreal;
    cfg.backend.surreal_url = "mem://".to_string();
    cfg.backend.artifact_dir = dir.path().join("artifacts");
    write_listings(dir.path(), 40);
    process(&cfg.raw_data, &cfg.processed_data).unwrap();

    let backend = Backend::connect(&cfg).await.unwrap();
    let report = backend.trainer(&cfg).train(&cfg.processed_data).await.unwrap();
    assert_eq!(report.version, Some(1));

    promote_best(&backend.policy(&cfg.metric_key), &backend.executor(), &cfg.model_name)
        .await
        .unwrap();
    let holder = backend.loader().load_production(&cfg.model_name).await;
    assert!(holder.is_loaded());
}
