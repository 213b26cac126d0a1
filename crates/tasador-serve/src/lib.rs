//! Tasador Serve
//!
//! axum prediction API over the model loaded once at startup:
//!
//! - `GET /` liveness message
//! - `POST /predict` `{bed, bath, house_size}` → `{predicted_price}`, or
//!   `{error}` when no model is loaded
//! - `GET /metrics` Prometheus text exposition

mod handlers;
pub mod metrics;

pub use handlers::*;
pub use metrics::{PredictionOutcome, ServeMetrics};

use std::sync::Arc;

use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tasador_core::{ModelHolder, TasadorError};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

/// Environment variable naming the listen address.
pub const ENV_BIND: &str = "TASADOR_BIND";
pub const DEFAULT_BIND: &str = "0.0.0.0:8000";

/// Server errors
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("bind error on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The loaded model expects an input the API does not accept.
    #[error("model feature '{0}' is not a request field")]
    UnsupportedFeature(String),

    #[error("prediction failed: {0}")]
    Prediction(#[source] TasadorError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.to_string() }));
        (StatusCode::INTERNAL_SERVER_ERROR, body).into_response()
    }
}

/// Shared handler state. The holder never changes after startup.
#[derive(Clone)]
pub struct AppState {
    pub holder: ModelHolder,
    pub metrics: Arc<ServeMetrics>,
}

impl AppState {
    pub fn new(holder: ModelHolder) -> Result<Self, ServeError> {
        let metrics = ServeMetrics::new()?;
        metrics.set_model_loaded(holder.is_loaded());
        Ok(Self {
            holder,
            metrics: Arc::new(metrics),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/predict", post(predict))
        .route("/metrics", get(metrics::metrics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            metrics::track_requests,
        ))
        .with_state(state)
}

/// Bind `addr` and serve until the process exits.
pub async fn serve(addr: &str, state: AppState) -> Result<(), ServeError> {
    let listener = TcpListener::bind(addr).await.map_err(|source| ServeError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    info!(addr = %addr, model_loaded = state.holder.is_loaded(), "prediction API listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
