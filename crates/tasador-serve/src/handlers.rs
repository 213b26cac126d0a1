//! HTTP request handlers
//!
//! Both routes answer `200`; a missing model is reported in the body.
//! Only a failed computation, such as an overflowing price, is a `500`.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tasador_core::{TasadorError, METRICS};
use tracing::{debug, warn};

use crate::{AppState, PredictionOutcome, ServeError};

pub const RUNNING_MESSAGE: &str = "API de predicción de propiedades en funcionamiento";
pub const UNAVAILABLE_MESSAGE: &str = "Modelo no disponible. Intenta más tarde.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictRequest {
    pub bed: f64,
    pub bath: f64,
    pub house_size: f64,
}

impl PredictRequest {
    fn feature(&self, name: &str) -> Option<f64> {
        match name {
            "bed" => Some(self.bed),
            "bath" => Some(self.bath),
            "house_size" => Some(self.house_size),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PredictResponse {
    Price { predicted_price: f64 },
    Unavailable { error: String },
}

pub async fn root() -> Json<StatusResponse> {
    Json(StatusResponse {
        message: RUNNING_MESSAGE.to_string(),
    })
}

pub async fn predict(
    State(state): State<AppState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictResponse>, ServeError> {
    let Some(loaded) = state.holder.current() else {
        METRICS.inc_predictions_refused();
        state.metrics.observe_prediction(PredictionOutcome::Unavailable);
        debug!("prediction refused, no model loaded");
        return Ok(Json(PredictResponse::Unavailable {
            error: UNAVAILABLE_MESSAGE.to_string(),
        }));
    };

    // Order inputs the way the model was trained.
    let features = loaded
        .model
        .features
        .iter()
        .map(|name| {
            request
                .feature(name)
                .ok_or_else(|| ServeError::UnsupportedFeature(name.clone()))
        })
        .collect::<Result<Vec<f64>, ServeError>>()
        .inspect_err(|_| state.metrics.observe_prediction(PredictionOutcome::Failed))?;

    match state.holder.predict(&features) {
        Ok(predicted_price) => {
            METRICS.inc_predictions_served();
            state.metrics.observe_prediction(PredictionOutcome::Served);
            Ok(Json(PredictResponse::Price { predicted_price }))
        }
        Err(TasadorError::ModelUnavailable(_)) => {
            METRICS.inc_predictions_refused();
            state.metrics.observe_prediction(PredictionOutcome::Unavailable);
            Ok(Json(PredictResponse::Unavailable {
                error: UNAVAILABLE_MESSAGE.to_string(),
            }))
        }
        Err(err) => {
            warn!(error = %err, version = loaded.version, "prediction failed");
            state.metrics.observe_prediction(PredictionOutcome::Failed);
            Err(ServeError::Prediction(err))
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tasador_core::{LinearModel, LoadedModel, ModelHolder};
    use tasador_state::RunId;

    fn loaded_state(features: &[&str]) -> AppState {
        AppState::new(ModelHolder::loaded(LoadedModel {
            model_name: "real_estate_model".to_string(),
            version: 3,
            run_id: RunId("run-1".to_string()),
            model: LinearModel {
                features: features.iter().map(|f| f.to_string()).collect(),
                intercept: 1000.0,
                coefficients: vec![10.0; features.len()],
            },
        }))
        .unwrap()
    }

    fn request() -> PredictRequest {
        PredictRequest {
            bed: 3.0,
            bath: 2.0,
            house_size: 120.0,
        }
    }

    #[tokio::test]
    async fn root_reports_running() {
        let Json(body) = root().await;
        assert_eq!(body.message, RUNNING_MESSAGE);
    }

    #[tokio::test]
    async fn predict_uses_model_feature_order() {
        let state = loaded_state(&["house_size", "bed", "bath"]);
        let Json(body) = predict(State(state), Json(request())).await.unwrap();
        assert_eq!(
            body,
            PredictResponse::Price {
                predicted_price: 1000.0 + 1200.0 + 30.0 + 20.0
            }
        );
    }

    #[tokio::test]
    async fn predict_without_model_is_unavailable() {
        let state = AppState::new(ModelHolder::empty()).unwrap();
        let Json(body) = predict(State(state), Json(request())).await.unwrap();
        assert_eq!(
            body,
            PredictResponse::Unavailable {
                error: UNAVAILABLE_MESSAGE.to_string()
            }
        );
    }

    #[tokio::test]
    async fn overflowing_price_is_an_error_not_null() {
        let state = loaded_state(&["bed", "bath", "house_size"]);
        let request = PredictRequest {
            bed: 1.0,
            bath: 1.0,
            house_size: f64::MAX,
        };
        let err = predict(State(state.clone()), Json(request)).await.unwrap_err();
        assert!(matches!(err, ServeError::Prediction(TasadorError::Model(_))));

        let (_, body) = state.metrics.render().unwrap();
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains(r#"tasador_predictions_total{outcome="failed"} 1"#));
    }

    #[tokio::test]
    async fn unknown_model_feature_is_an_error() {
        let state = loaded_state(&["bed", "acre_lot"]);
        let err = predict(State(state), Json(request())).await.unwrap_err();
        assert!(matches!(err, ServeError::UnsupportedFeature(ref f) if f == "acre_lot"));
    }

    #[test]
    fn responses_serialize_untagged() {
        let price = serde_json::to_value(PredictResponse::Price {
            predicted_price: 5.0,
        })
        .unwrap();
        assert_eq!(price, serde_json::json!({"predicted_price": 5.0}));

        let unavailable = serde_json::to_value(PredictResponse::Unavailable {
            error: UNAVAILABLE_MESSAGE.to_string(),
        })
        .unwrap();
        assert_eq!(
            unavailable,
            serde_json::json!({"error": "Modelo no disponible. Intenta más tarde."})
        );
    }
}
