//! Serving loader and the read-only model holder.
//!
//! The loader runs once at process start. Whatever it produces is held for
//! the lifetime of the process; a failed load leaves the holder empty and
//! every prediction reports the model as unavailable.

use std::sync::Arc;
use std::time::Duration;

use tasador_state::{ArtifactStore, ModelVersion, RunId, Stage, TrackingBackend};
use tracing::{instrument, warn};

use crate::deadline::bounded;
use crate::error::{Result, TasadorError};
use crate::model::{LinearModel, ModelError};
use crate::obs;

/// The Production model loaded at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub model_name: String,
    pub version: u64,
    pub run_id: RunId,
    pub model: LinearModel,
}

/// Holder built once at startup. There is no way to replace its content.
#[derive(Debug, Clone, Default)]
pub struct ModelHolder {
    inner: Option<Arc<LoadedModel>>,
}

impl ModelHolder {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn loaded(model: LoadedModel) -> Self {
        Self {
            inner: Some(Arc::new(model)),
        }
    }

    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        self.inner.clone()
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.is_some()
    }

    /// Predict with the held model, or `ModelUnavailable`. Overflowing
    /// inputs yield `ModelError::NonFinitePrediction`.
    pub fn predict(&self, features: &[f64]) -> Result<f64> {
        let loaded = self
            .inner
            .as_ref()
            .ok_or_else(|| TasadorError::ModelUnavailable("no Production model loaded".to_string()))?;
        let price = loaded.model.predict(features)?;
        if !price.is_finite() {
            return Err(ModelError::NonFinitePrediction(price).into());
        }
        Ok(price)
    }
}

pub struct ServingLoader {
    tracking: Arc<dyn TrackingBackend>,
    artifacts: Arc<dyn ArtifactStore>,
    timeout: Duration,
}

impl ServingLoader {
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

    /// Load the Production version of `model_name`. Consumes the loader so
    /// it runs once; never fails, an unusable registry yields an empty holder.
    pub async fn load_production(self, model_name: &str) -> ModelHolder {
        match self.try_load(model_name).await {
            Ok(loaded) => {
                obs::emit_serving_loaded(model_name, loaded.version, &loaded.run_id.0);
                ModelHolder::loaded(loaded)
            }
            Err(err) => {
                obs::emit_serving_unavailable(model_name, &err);
                ModelHolder::empty()
            }
        }
    }

    #[instrument(skip(self))]
    async fn try_load(&self, model_name: &str) -> Result<LoadedModel> {
        let versions = bounded(
            self.timeout,
            "list_versions",
            self.tracking.list_versions(model_name),
        )
        .await?;

        let production: Vec<&ModelVersion> = versions
            .iter()
            .filter(|v| v.stage == Stage::Production)
            .collect();
        if production.len() > 1 {
            warn!(
                model = %model_name,
                versions = ?production.iter().map(|v| v.version).collect::<Vec<_>>(),
                "more than one Production version; loading the highest"
            );
        }
        let chosen = production
            .into_iter()
            .max_by_key(|v| v.version)
            .ok_or_else(|| TasadorError::ModelUnavailable(format!("'{}' has no Production version", model_name)))?;

        let digest = chosen.source.as_ref().ok_or_else(|| {
            TasadorError::ModelUnavailable(format!("version {} has no artifact", chosen.version))
        })?;
        let bytes = bounded(self.timeout, "artifact_get", self.artifacts.get(digest)).await?;
        let model = LinearModel::from_json_bytes(&bytes)?;

        Ok(LoadedModel {
            model_name: model_name.to_string(),
            version: chosen.version,
            run_id: chosen.run_id.clone(),
            model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LoadedModel {
        LoadedModel {
            model_name: "m".into(),
            version: 1,
            run_id: RunId("r".into()),
            model: LinearModel {
                features: vec!["bed".into(), "bath".into(), "house_size".into()],
                intercept: 1000.0,
                coefficients: vec![10.0, 20.0, 30.0],
            },
        }
    }

    #[test]
    fn empty_holder_refuses() {
        let holder = ModelHolder::empty();
        assert!(holder.current().is_none());
        assert!(matches!(
            holder.predict(&[1.0, 1.0, 1.0]),
            Err(TasadorError::ModelUnavailable(_))
        ));
    }

    #[test]
    fn overflowing_prediction_is_an_error() {
        let holder = ModelHolder::loaded(sample());
        let err = holder.predict(&[1.0, 1.0, f64::MAX]).unwrap_err();
        assert!(matches!(
            err,
            TasadorError::Model(ModelError::NonFinitePrediction(v)) if v.is_infinite()
        ));
    }

    #[test]
    fn loaded_holder_predicts() {
        let holder = ModelHolder::loaded(sample());
        assert_eq!(holder.predict(&[3.0, 2.0, 100.0]).unwrap(), 1000.0 + 30.0 + 40.0 + 3000.0);
        assert_eq!(holder.current().unwrap().version, 1);
    }
}
