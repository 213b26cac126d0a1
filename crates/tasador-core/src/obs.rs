//! Structured observability hooks for Tasador lifecycle events.
//!
//! Every helper emits one event carrying an `event = "..."` field so log
//! pipelines can filter on it. Degraded-but-recovered outcomes are `warn!`.

use tracing::{info, warn};

/// RAII guard that enters a pipeline-scoped span for the duration of a run.
pub struct PipelineSpan {
    _span: tracing::span::EnteredSpan,
}

impl PipelineSpan {
    pub fn enter(pipeline: &str, model_name: &str) -> Self {
        let span = tracing::info_span!("tasador.pipeline", pipeline = %pipeline, model = %model_name);
        Self {
            _span: span.entered(),
        }
    }
}

/// A training run was persisted.
pub fn emit_run_recorded(run_id: &str, metrics: usize, with_artifact: bool) {
    info!(
        event = "run.recorded",
        run_id = %run_id,
        metrics = metrics,
        with_artifact = with_artifact,
    );
}

/// Experiment lookup/creation failed; the run continues without one.
pub fn emit_experiment_setup_failed(experiment: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.experiment_setup_failed", experiment = %experiment, error = %error);
}

/// Artifact logging failed; falling back to a metrics-only record.
pub fn emit_model_logging_fallback(model_name: &str, error: &dyn std::fmt::Display) {
    warn!(event = "run.model_logging_fallback", model = %model_name, error = %error);
}

/// A version was excluded from promotion candidacy.
pub fn emit_version_skipped(model_name: &str, version: u64, reason: &dyn std::fmt::Display) {
    warn!(
        event = "policy.version_skipped",
        model = %model_name,
        version = version,
        reason = %reason,
    );
}

/// The policy picked a version.
pub fn emit_selected(model_name: &str, version: u64, metric_key: &str, metric: f64) {
    info!(
        event = "policy.selected",
        model = %model_name,
        version = version,
        metric_key = %metric_key,
        metric = metric,
    );
}

/// No version had a usable metric.
pub fn emit_no_candidate(model_name: &str, versions_seen: usize) {
    warn!(event = "policy.no_candidate", model = %model_name, versions_seen = versions_seen);
}

/// A promotion completed (or was already in place).
pub fn emit_promotion_applied(model_name: &str, version: u64, archived: &[u64], no_op: bool) {
    info!(
        event = "promotion.applied",
        model = %model_name,
        version = version,
        archived = ?archived,
        no_op = no_op,
    );
}

/// Target is Production but some older versions were not archived.
pub fn emit_promotion_partial(
    model_name: &str,
    version: u64,
    pending: &[u64],
    error: &dyn std::fmt::Display,
) {
    warn!(
        event = "promotion.partial",
        model = %model_name,
        version = version,
        pending = ?pending,
        error = %error,
    );
}

/// Serving loaded a Production model.
pub fn emit_serving_loaded(model_name: &str, version: u64, run_id: &str) {
    info!(event = "serving.loaded", model = %model_name, version = version, run_id = %run_id);
}

/// Serving starts without a model.
pub fn emit_serving_unavailable(model_name: &str, reason: &dyn std::fmt::Display) {
    warn!(event = "serving.unavailable", model = %model_name, reason = %reason);
}

pub fn emit_step_started(step: &str, attempt: u32) {
    info!(event = "pipeline.step_started", step = %step, attempt = attempt);
}

pub fn emit_step_finished(step: &str, duration_ms: u64) {
    info!(event = "pipeline.step_finished", step = %step, duration_ms = duration_ms);
}

/// A step attempt failed; `will_retry` tells whether another attempt follows.
pub fn emit_step_failed(step: &str, attempt: u32, will_retry: bool, error: &dyn std::fmt::Display) {
    warn!(
        event = "pipeline.step_failed",
        step = %step,
        attempt = attempt,
        will_retry = will_retry,
        error = %error,
    );
}

/// A step never ran because an upstream step failed.
pub fn emit_step_skipped(step: &str, failed_upstream: &str) {
    warn!(event = "pipeline.step_skipped", step = %step, failed_upstream = %failed_upstream);
}
