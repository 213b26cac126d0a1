//! Stage transition executor: move one version to Production and archive
//! every other Production version of the same model.
//!
//! The transition is two writes (promote target, archive siblings) that the
//! registry does not make atomic. Promotions of the same model name are
//! serialized through [`PromotionLocks`]; a failure between the two writes
//! is reported as [`PartialPromotion`] and can be finished with
//! [`StageExecutor::retry_archival`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tasador_state::{ModelVersion, Stage, TrackingBackend};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::deadline::bounded;
use crate::error::{Result, TasadorError};
use crate::metrics::METRICS;
use crate::obs;
use crate::policy::{PromotionPolicy, SelectionReport};

/// Per-model-name async locks.
#[derive(Clone, Default)]
pub struct PromotionLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

impl PromotionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `model_name`.
    pub async fn acquire(&self, model_name: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.entry(model_name.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionStatus {
    /// Target moved to Production
    Promoted,
    /// Target was already the only Production version
    AlreadyProduction,
    /// Target was already Production; leftover siblings were archived
    ArchivalCompleted,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PromotionResult {
    pub model_name: String,
    pub version: u64,
    pub status: PromotionStatus,
    /// Versions moved from Production to Archived by this call
    pub archived: Vec<u64>,
}

/// Target is Production but some previous Production versions are not
/// archived yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialPromotion {
    pub model_name: String,
    pub promoted_version: u64,
    pub archived: Vec<u64>,
    /// Versions still in Production besides the promoted one
    pub pending: Vec<u64>,
    pub reason: String,
}

impl fmt::Display for PartialPromotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partial promotion of '{}' v{}: versions {:?} still Production ({})",
            self.model_name, self.promoted_version, self.pending, self.reason
        )
    }
}

pub struct StageExecutor {
    tracking: Arc<dyn TrackingBackend>,
    locks: PromotionLocks,
    timeout: Duration,
}

impl StageExecutor {
    pub fn new(tracking: Arc<dyn TrackingBackend>, timeout: Duration) -> Self {
        Self::with_locks(tracking, PromotionLocks::new(), timeout)
    }

    /// Share locks with other executors over the same registry.
    pub fn with_locks(tracking: Arc<dyn TrackingBackend>, locks: PromotionLocks, timeout: Duration) -> Self {
        Self {
            tracking,
            locks,
            timeout,
        }
    }

    async fn versions(&self, model_name: &str) -> Result<Vec<ModelVersion>> {
        Ok(bounded(
            self.timeout,
            "list_versions",
            self.tracking.list_versions(model_name),
        )
        .await?)
    }

    /// Make `version` the single Production version of `model_name`.
    ///
    /// Idempotent. An unknown version fails with `VersionNotFound` and an
    /// archived one with `StageConflict`, both before anything is written.
    #[instrument(skip(self))]
    pub async fn promote(&self, model_name: &str, version: u64) -> Result<PromotionResult> {
        let _guard = self.locks.acquire(model_name).await;

        let versions = self.versions(model_name).await?;
        let target = versions
            .iter()
            .find(|v| v.version == version)
            .ok_or_else(|| TasadorError::VersionNotFound {
                name: model_name.to_string(),
                version,
            })?;
        if target.stage == Stage::Archived {
            return Err(TasadorError::StageConflict {
                name: model_name.to_string(),
                version,
                stage: target.stage.to_string(),
                expected: "a non-archived stage".to_string(),
            });
        }
        let siblings = production_siblings(&versions, version);

        if target.stage == Stage::Production && siblings.is_empty() {
            obs::emit_promotion_applied(model_name, version, &[], true);
            return Ok(PromotionResult {
                model_name: model_name.to_string(),
                version,
                status: PromotionStatus::AlreadyProduction,
                archived: Vec::new(),
            });
        }

        let status = if target.stage == Stage::Production {
            PromotionStatus::ArchivalCompleted
        } else {
            bounded(
                self.timeout,
                "set_stage",
                self.tracking
                    .set_stage(model_name, version, Stage::Production, false),
            )
            .await?;
            debug!(model = %model_name, version, "target set to Production");
            PromotionStatus::Promoted
        };

        let archived = self.archive(model_name, version, siblings).await?;
        METRICS.inc_promotions_applied();
        obs::emit_promotion_applied(model_name, version, &archived, false);

        Ok(PromotionResult {
            model_name: model_name.to_string(),
            version,
            status,
            archived,
        })
    }

    /// Finish a partial promotion: archive every Production version except
    /// `promoted_version` without touching the promoted one.
    #[instrument(skip(self))]
    pub async fn retry_archival(&self, model_name: &str, promoted_version: u64) -> Result<PromotionResult> {
        let _guard = self.locks.acquire(model_name).await;

        let versions = self.versions(model_name).await?;
        let target = versions
            .iter()
            .find(|v| v.version == promoted_version)
            .ok_or_else(|| TasadorError::VersionNotFound {
                name: model_name.to_string(),
                version: promoted_version,
            })?;
        if target.stage != Stage::Production {
            return Err(TasadorError::StageConflict {
                name: model_name.to_string(),
                version: promoted_version,
                stage: target.stage.to_string(),
                expected: Stage::Production.to_string(),
            });
        }

        let siblings = production_siblings(&versions, promoted_version);
        let archived = self.archive(model_name, promoted_version, siblings).await?;
        obs::emit_promotion_applied(model_name, promoted_version, &archived, archived.is_empty());

        Ok(PromotionResult {
            model_name: model_name.to_string(),
            version: promoted_version,
            status: PromotionStatus::ArchivalCompleted,
            archived,
        })
    }

    /// Archive each sibling; any failure yields `PartialPromotion`.
    async fn archive(&self, model_name: &str, promoted: u64, siblings: Vec<u64>) -> Result<Vec<u64>> {
        let mut archived = Vec::new();
        let mut pending = Vec::new();
        let mut last_error = None;

        for sibling in siblings {
            match bounded(
                self.timeout,
                "set_stage",
                self.tracking
                    .set_stage(model_name, sibling, Stage::Archived, false),
            )
            .await
            {
                Ok(_) => archived.push(sibling),
                Err(e) => {
                    pending.push(sibling);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            None => Ok(archived),
            Some(e) => {
                let partial = PartialPromotion {
                    model_name: model_name.to_string(),
                    promoted_version: promoted,
                    archived,
                    pending,
                    reason: e.to_string(),
                };
                METRICS.inc_partial_promotions();
                obs::emit_promotion_partial(model_name, promoted, &partial.pending, &e);
                Err(TasadorError::PartialPromotion(partial))
            }
        }
    }
}

fn production_siblings(versions: &[ModelVersion], version: u64) -> Vec<u64> {
    versions
        .iter()
        .filter(|v| v.version != version && v.stage == Stage::Production)
        .map(|v| v.version)
        .collect()
}

/// Select the best version and promote it.
///
/// `NoPromotionCandidate` when nothing is eligible; callers on the pipeline
/// path treat that as a warning outcome.
pub async fn promote_best(
    policy: &PromotionPolicy,
    executor: &StageExecutor,
    model_name: &str,
) -> Result<(SelectionReport, PromotionResult)> {
    let report = policy.evaluate(model_name).await?;
    let version = match &report.selected {
        Some(candidate) => candidate.version,
        None => return Err(TasadorError::NoPromotionCandidate(model_name.to_string())),
    };
    let result = executor.promote(model_name, version).await?;
    Ok((report, result))
}
