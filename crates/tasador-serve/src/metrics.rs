//! Prometheus metrics for the prediction API, exposed on `GET /metrics`.
//!
//! Request metrics are labelled by route template, method and status class.

use std::time::{Duration, Instant};

use axum::{
    extract::{MatchedPath, Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::{AppState, ServeError};

/// Result of one `/predict` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionOutcome {
    Served,
    Unavailable,
    Failed,
}

impl PredictionOutcome {
    fn label(self) -> &'static str {
        match self {
            PredictionOutcome::Served => "served",
            PredictionOutcome::Unavailable => "unavailable",
            PredictionOutcome::Failed => "failed",
        }
    }
}

pub struct ServeMetrics {
    registry: Registry,
    http_requests: IntCounterVec,
    http_duration: HistogramVec,
    predictions: IntCounterVec,
    model_loaded: IntGauge,
}

impl ServeMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests = IntCounterVec::new(
            Opts::new("http_requests_total", "Total number of requests by handler, method and status"),
            &["handler", "method", "status"],
        )?;
        let http_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Latency of requests by handler and method",
            ),
            &["handler", "method"],
        )?;
        let predictions = IntCounterVec::new(
            Opts::new("tasador_predictions_total", "Prediction requests by outcome"),
            &["outcome"],
        )?;
        let model_loaded = IntGauge::new(
            "tasador_model_loaded",
            "1 when a Production model was loaded at startup",
        )?;

        registry.register(Box::new(http_requests.clone()))?;
        registry.register(Box::new(http_duration.clone()))?;
        registry.register(Box::new(predictions.clone()))?;
        registry.register(Box::new(model_loaded.clone()))?;

        Ok(Self {
            registry,
            http_requests,
            http_duration,
            predictions,
            model_loaded,
        })
    }

    pub fn observe_request(&self, handler: &str, method: &str, status: u16, elapsed: Duration) {
        self.http_requests
            .with_label_values(&[handler, method, status_class(status)])
            .inc();
        self.http_duration
            .with_label_values(&[handler, method])
            .observe(elapsed.as_secs_f64());
    }

    pub fn observe_prediction(&self, outcome: PredictionOutcome) {
        self.predictions.with_label_values(&[outcome.label()]).inc();
    }

    pub fn set_model_loaded(&self, loaded: bool) {
        self.model_loaded.set(i64::from(loaded));
    }

    /// Text exposition format and its content type.
    pub fn render(&self) -> Result<(String, Vec<u8>), prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buf = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buf)?;
        Ok((encoder.format_type().to_string(), buf))
    }
}

fn status_class(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

/// Count and time every routed request.
pub async fn track_requests(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let handler = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let method = req.method().to_string();

    let started = Instant::now();
    let response = next.run(req).await;
    state.metrics.observe_request(
        &handler,
        &method,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

pub async fn metrics(State(state): State<AppState>) -> Result<Response, ServeError> {
    let (content_type, body) = state.metrics.render()?;
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(metrics: &ServeMetrics) -> String {
        let (content_type, body) = metrics.render().unwrap();
        assert!(content_type.starts_with("text/plain"));
        String::from_utf8(body).unwrap()
    }

    #[test]
    fn requests_are_grouped_by_status_class() {
        let metrics = ServeMetrics::new().unwrap();
        metrics.observe_request("/predict", "POST", 200, Duration::from_millis(3));
        metrics.observe_request("/predict", "POST", 201, Duration::from_millis(3));
        metrics.observe_request("/predict", "POST", 500, Duration::from_millis(3));

        let text = rendered(&metrics);
        assert!(text.contains(r#"http_requests_total{handler="/predict",method="POST",status="2xx"} 2"#));
        assert!(text.contains(r#"http_requests_total{handler="/predict",method="POST",status="5xx"} 1"#));
        assert!(text.contains(r#"http_request_duration_seconds_count{handler="/predict",method="POST"} 3"#));
    }

    #[test]
    fn prediction_outcomes_and_model_gauge() {
        let metrics = ServeMetrics::new().unwrap();
        metrics.observe_prediction(PredictionOutcome::Served);
        metrics.observe_prediction(PredictionOutcome::Unavailable);
        metrics.observe_prediction(PredictionOutcome::Unavailable);
        metrics.set_model_loaded(true);

        let text = rendered(&metrics);
        assert!(text.contains(r#"tasador_predictions_total{outcome="served"} 1"#));
        assert!(text.contains(r#"tasador_predictions_total{outcome="unavailable"} 2"#));
        assert!(text.contains("tasador_model_loaded 1"));
    }

    #[test]
    fn registries_are_independent() {
        let first = ServeMetrics::new().unwrap();
        let second = ServeMetrics::new().unwrap();
        first.observe_prediction(PredictionOutcome::Failed);

        assert!(rendered(&first).contains(r#"outcome="failed"} 1"#));
        assert!(!rendered(&second).contains(r#"outcome="failed""#));
    }
}
