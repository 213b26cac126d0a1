//! Training: precondition check, train/test split, OLS fit, R² scoring and
//! run recording.

use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Serialize, Serializer};
use tasador_state::{ParamValue, RunDraft, RunId};
use tracing::{info, instrument};

use crate::config::PipelineConfig;
use crate::dataset::{Table, TrainingFrame};
use crate::error::{Result, TasadorError};
use crate::model::{r2_score, LinearModel};
use crate::obs;
use crate::recorder::RunRecorder;

pub const MODEL_TYPE: &str = "LinearRegression";

/// A fitted model and its held-out score.
#[derive(Debug, Clone, PartialEq)]
pub struct FitOutcome {
    pub model: LinearModel,
    pub score: f64,
    pub train_rows: usize,
    pub test_rows: usize,
}

/// Shuffle, split, fit on the train part and score on the test part.
///
/// The test part is `ceil(n * test_fraction)` rows. Both parts must be large
/// enough to fit and score.
pub fn fit_and_score(frame: &TrainingFrame, test_fraction: f64, seed: Option<u64>) -> Result<FitOutcome> {
    let n = frame.len();
    let test_rows = ((n as f64) * test_fraction).ceil() as usize;
    let train_rows = n.saturating_sub(test_rows);
    let params = frame.features.len() + 1;

    if test_rows < 2 || train_rows < params {
        return Err(TasadorError::Training(format!(
            "{} rows cannot be split into {} train / {} test with {} parameters",
            n, train_rows, test_rows, params
        )));
    }

    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut rng);
    let (test_idx, train_idx) = indices.split_at(test_rows);

    let pick_x = |idx: &[usize]| idx.iter().map(|&i| frame.x[i].clone()).collect::<Vec<_>>();
    let pick_y = |idx: &[usize]| idx.iter().map(|&i| frame.y[i]).collect::<Vec<_>>();

    let model = LinearModel::fit(&frame.features, &pick_x(train_idx), &pick_y(train_idx))?;
    let predictions = model.predict_many(&pick_x(test_idx))?;
    let score = r2_score(&pick_y(test_idx), &predictions);

    Ok(FitOutcome {
        model,
        score,
        train_rows,
        test_rows,
    })
}

/// Result of one training attempt.
#[derive(Debug, Serialize)]
pub struct TrainingReport {
    pub run_id: RunId,
    pub experiment_id: Option<String>,
    /// Registered version, `None` for a metrics-only run
    pub version: Option<u64>,
    pub metric_key: String,
    pub score: f64,
    pub train_rows: usize,
    pub test_rows: usize,
    /// Non-fatal failures (experiment setup, model logging)
    #[serde(serialize_with = "error_messages")]
    pub recovered: Vec<TasadorError>,
}

fn error_messages<S: Serializer>(errors: &[TasadorError], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(errors.iter().map(|e| e.to_string()))
}

pub struct Trainer {
    recorder: RunRecorder,
    config: PipelineConfig,
}

impl Trainer {
    pub fn new(recorder: RunRecorder, config: PipelineConfig) -> Self {
        Self { recorder, config }
    }

    /// Train on the processed dataset at `path` and record the attempt.
    #[instrument(skip(self, path), fields(model = %self.config.model_name))]
    pub async fn train(&self, path: impl AsRef<Path>) -> Result<TrainingReport> {
        let table = Table::read(path)?;
        let frame = TrainingFrame::from_table(
            &table,
            &self.config.features,
            &self.config.target,
            self.config.min_rows,
        )?;
        let fit = fit_and_score(&frame, self.config.test_fraction, self.config.seed)?;
        info!(score = fit.score, train_rows = fit.train_rows, test_rows = fit.test_rows, "model fitted");

        self.record(fit).await
    }

    /// Record an already fitted model.
    pub async fn record(&self, fit: FitOutcome) -> Result<TrainingReport> {
        let cfg = &self.config;
        let mut recovered = Vec::new();

        let experiment_id = match self
            .recorder
            .setup_experiment(&cfg.experiment_name, cfg.artifact_location.as_deref())
            .await
        {
            Ok(experiment) => Some(experiment.experiment_id),
            Err(err) => {
                obs::emit_experiment_setup_failed(&cfg.experiment_name, &err);
                recovered.push(err);
                None
            }
        };

        let mut draft = RunDraft::new(experiment_id.clone())
            .param("features", ParamValue::List(cfg.features.clone()))
            .param("model_type", MODEL_TYPE)
            .param("test_fraction", cfg.test_fraction.to_string().as_str())
            .metric(&cfg.metric_key, fit.score);
        if let Some(seed) = cfg.seed {
            draft = draft.param("seed", seed.to_string().as_str());
        }

        let artifact = fit.model.to_json_bytes()?;
        let logged = self
            .recorder
            .log_model(&cfg.model_name, draft, &artifact)
            .await?;
        recovered.extend(logged.recovered);

        Ok(TrainingReport {
            run_id: logged.run.run_id,
            experiment_id,
            version: logged.version.map(|v| v.version),
            metric_key: cfg.metric_key.clone(),
            score: fit.score,
            train_rows: fit.train_rows,
            test_rows: fit.test_rows,
            recovered,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: usize) -> TrainingFrame {
        let x: Vec<Vec<f64>> = (0..n)
            .map(|i| {
                let i = i as f64;
                vec![1.0 + (i % 5.0), 1.0 + (i % 3.0), 50.0 + 7.0 * i]
            })
            .collect();
        let y = x
            .iter()
            .map(|r| 20000.0 * r[0] + 15000.0 * r[1] + 2500.0 * r[2] + 5000.0)
            .collect();
        TrainingFrame {
            features: vec!["bed".into(), "bath".into(), "house_size".into()],
            x,
            y,
        }
    }

    #[test]
    fn split_sizes_follow_fraction() {
        let outcome = fit_and_score(&frame(50), 0.2, Some(7)).unwrap();
        assert_eq!(outcome.test_rows, 10);
        assert_eq!(outcome.train_rows, 40);
        assert!((outcome.score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn seeded_split_is_deterministic() {
        let a = fit_and_score(&frame(30), 0.2, Some(42)).unwrap();
        let b = fit_and_score(&frame(30), 0.2, Some(42)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn tiny_dataset_cannot_split() {
        let err = fit_and_score(&frame(4), 0.2, Some(1)).unwrap_err();
        assert!(matches!(err, TasadorError::Training(_)));
    }
}
