//! Promotion policy: pick the version whose run scored best.
//!
//! Read-only. Versions are considered in ascending version order; the
//! strictly greatest metric wins, so ties resolve to the lowest version.
//! Archived versions are never candidates.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tasador_state::{ModelVersion, RunId, RunRecord, Stage, StorageError, TrackingBackend};
use tracing::instrument;

use crate::deadline::bounded;
use crate::error::{Result, TasadorError};
use crate::metrics::METRICS;
use crate::obs;

/// A version that is eligible for promotion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Candidate {
    pub version: u64,
    pub run_id: RunId,
    pub metric: f64,
}

/// Why a version was not a candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    /// Archived versions never return to Production
    Archived,
    /// The run has no value for the metric key
    MetricMissing,
    /// The metric is NaN or infinite
    NonFiniteMetric { value: String },
    /// The referenced run does not exist
    RunNotFound,
    /// The run could not be read for another reason
    RunUnreadable { error: String },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Archived => f.write_str("version is archived"),
            SkipReason::MetricMissing => f.write_str("metric missing"),
            SkipReason::NonFiniteMetric { value } => write!(f, "metric is {}", value),
            SkipReason::RunNotFound => f.write_str("run not found"),
            SkipReason::RunUnreadable { error } => write!(f, "run unreadable: {}", error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SkippedVersion {
    pub version: u64,
    pub reason: SkipReason,
}

/// Everything the policy looked at for one decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SelectionReport {
    pub model_name: String,
    pub metric_key: String,
    pub versions_seen: usize,
    pub candidates: Vec<Candidate>,
    pub skipped: Vec<SkippedVersion>,
    pub selected: Option<Candidate>,
}

/// First candidate with the strictly greatest metric.
pub fn choose(candidates: &[Candidate]) -> Option<&Candidate> {
    candidates.iter().fold(None, |best: Option<&Candidate>, c| match best {
        Some(b) if c.metric <= b.metric => Some(b),
        _ => Some(c),
    })
}

/// Metric of `run` for `key`, or why there is none.
fn resolve_metric(run: &RunRecord, version: u64, key: &str) -> Result<f64> {
    let value = run.metric(key).ok_or_else(|| TasadorError::MetricMissing {
        version,
        metric: key.to_string(),
    })?;
    Ok(value)
}

pub struct PromotionPolicy {
    tracking: Arc<dyn TrackingBackend>,
    metric_key: String,
    timeout: Duration,
}

impl PromotionPolicy {
    pub fn new(tracking: Arc<dyn TrackingBackend>, metric_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            tracking,
            metric_key: metric_key.into(),
            timeout,
        }
    }

    pub fn metric_key(&self) -> &str {
        &self.metric_key
    }

    /// Version to promote, or `None` when no version has a usable metric.
    pub async fn select_best(&self, model_name: &str) -> Result<Option<u64>> {
        Ok(self.evaluate(model_name).await?.selected.map(|c| c.version))
    }

    /// Full decision with candidates and skipped versions.
    ///
    /// Only an unreachable registry is an error; per-version problems skip
    /// that version.
    #[instrument(skip(self), fields(metric = %self.metric_key))]
    pub async fn evaluate(&self, model_name: &str) -> Result<SelectionReport> {
        let mut versions: Vec<ModelVersion> = bounded(
            self.timeout,
            "list_versions",
            self.tracking.list_versions(model_name),
        )
        .await?;
        versions.sort_by_key(|v| v.version);

        let mut runs: HashMap<RunId, std::result::Result<RunRecord, SkipReason>> = HashMap::new();
        let mut candidates = Vec::new();
        let mut skipped = Vec::new();

        for version in &versions {
            if version.stage == Stage::Archived {
                obs::emit_version_skipped(model_name, version.version, &SkipReason::Archived);
                METRICS.inc_versions_skipped();
                skipped.push(SkippedVersion {
                    version: version.version,
                    reason: SkipReason::Archived,
                });
                continue;
            }

            if !runs.contains_key(&version.run_id) {
                let fetched = match bounded(
                    self.timeout,
                    "get_run",
                    self.tracking.get_run(&version.run_id),
                )
                .await
                {
                    Ok(run) => Ok(run),
                    Err(StorageError::RunNotFound { .. }) => Err(SkipReason::RunNotFound),
                    Err(e) if e.is_unavailable() => return Err(e.into()),
                    Err(e) => Err(SkipReason::RunUnreadable {
                        error: e.to_string(),
                    }),
                };
                runs.insert(version.run_id.clone(), fetched);
            }

            let outcome = match &runs[&version.run_id] {
                Ok(run) => match resolve_metric(run, version.version, &self.metric_key) {
                    Ok(value) if value.is_finite() => Ok(value),
                    Ok(value) => Err(SkipReason::NonFiniteMetric {
                        value: value.to_string(),
                    }),
                    Err(TasadorError::MetricMissing { .. }) => Err(SkipReason::MetricMissing),
                    Err(e) => return Err(e),
                },
                Err(reason) => Err(reason.clone()),
            };

            match outcome {
                Ok(metric) => candidates.push(Candidate {
                    version: version.version,
                    run_id: version.run_id.clone(),
                    metric,
                }),
                Err(reason) => {
                    obs::emit_version_skipped(model_name, version.version, &reason);
                    METRICS.inc_versions_skipped();
                    skipped.push(SkippedVersion {
                        version: version.version,
                        reason,
                    });
                }
            }
        }

        let selected = choose(&candidates).cloned();
        match &selected {
            Some(c) => obs::emit_selected(model_name, c.version, &self.metric_key, c.metric),
            None => obs::emit_no_candidate(model_name, versions.len()),
        }

        Ok(SelectionReport {
            model_name: model_name.to_string(),
            metric_key: self.metric_key.clone(),
            versions_seen: versions.len(),
            candidates,
            skipped,
            selected,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(version: u64, metric: f64) -> Candidate {
        Candidate {
            version,
            run_id: RunId(format!("run-{}", version)),
            metric,
        }
    }

    #[test]
    fn choose_picks_max() {
        let cs = [candidate(1, 0.71), candidate(2, 0.85), candidate(3, 0.60)];
        assert_eq!(choose(&cs).map(|c| c.version), Some(2));
    }

    #[test]
    fn choose_tie_goes_to_first() {
        let cs = [candidate(1, 0.5), candidate(2, 0.9), candidate(3, 0.9)];
        assert_eq!(choose(&cs).map(|c| c.version), Some(2));
    }

    #[test]
    fn choose_empty_is_none() {
        assert!(choose(&[]).is_none());
    }

    #[test]
    fn choose_handles_negative_scores() {
        let cs = [candidate(1, -3.0), candidate(2, -1.5)];
        assert_eq!(choose(&cs).map(|c| c.version), Some(2));
    }
}
