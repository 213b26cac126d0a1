//! Sequential DAG execution with per-step timeouts, retries and failure
//! containment.
//!
//! Steps run in topological order. Transient failures are retried with
//! exponential backoff; when a step exhausts its attempts every step that
//! depends on it, directly or transitively, is skipped.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use tasador_core::{obs, RetryConfig};
use tracing::{info, info_span, Instrument};

use crate::error::{PipelineError, PipelineResult, StepError};
use crate::graph::StepGraph;
use crate::step::{Step, StepContext, StepOutput};

/// Terminal state of one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed { error: String },
    /// Never ran because `upstream` failed or was itself skipped.
    Skipped { upstream: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub step: String,
    #[serde(flatten)]
    pub status: StepStatus,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Result of one pipeline run.
#[derive(Debug, Serialize)]
pub struct PipelineReport {
    pub pipeline: String,
    pub steps: Vec<StepRecord>,
    pub outputs: StepContext,
    #[serde(skip)]
    failures: Vec<(String, u32, StepError)>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn record(&self, step: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.step == step)
    }

    pub fn output(&self, step: &str) -> Option<&StepOutput> {
        self.outputs.get(step)
    }

    pub fn failures(&self) -> impl Iterator<Item = (&str, &StepError)> {
        self.failures.iter().map(|(step, _, err)| (step.as_str(), err))
    }

    /// Turn the first failed step into an error.
    pub fn into_result(mut self) -> PipelineResult<Self> {
        if self.failures.is_empty() {
            return Ok(self);
        }
        let (step, attempts, source) = self.failures.remove(0);
        Err(PipelineError::StepFailed { step, attempts, source })
    }
}

pub struct PipelineRunner {
    retry: RetryConfig,
    step_timeout: Option<Duration>,
}

impl PipelineRunner {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            step_timeout: None,
        }
    }

    /// Bound every attempt of every step.
    pub fn with_step_timeout(mut self, limit: Duration) -> Self {
        self.step_timeout = Some(limit);
        self
    }

    /// Run `graph` to completion. Step failures are reported, not returned;
    /// only an invalid graph is an error.
    pub async fn run(&self, pipeline: &str, graph: &StepGraph) -> PipelineResult<PipelineReport> {
        let plan = graph.plan()?;
        let span = info_span!("tasador.pipeline.run", pipeline = %pipeline, steps = plan.len());

        async move {
            let started = Instant::now();
            let mut ctx = StepContext::new();
            let mut steps = Vec::with_capacity(plan.len());
            let mut failures = Vec::new();
            // step name -> the failed step that blocks it
            let mut blocked: HashMap<String, String> = HashMap::new();

            for step in plan {
                let name = step.name().to_string();

                let upstream = step
                    .depends_on()
                    .into_iter()
                    .find_map(|dep| blocked.get(&dep).cloned());
                if let Some(upstream) = upstream {
                    obs::emit_step_skipped(&name, &upstream);
                    blocked.insert(name.clone(), upstream.clone());
                    steps.push(StepRecord {
                        step: name,
                        status: StepStatus::Skipped { upstream },
                        attempts: 0,
                        duration_ms: 0,
                    });
                    continue;
                }

                let step_started = Instant::now();
                let (attempts, outcome) = self.run_step(step.as_ref(), &ctx).await;
                let duration_ms = step_started.elapsed().as_millis() as u64;

                match outcome {
                    Ok(output) => {
                        obs::emit_step_finished(&name, duration_ms);
                        ctx.insert(&name, output);
                        steps.push(StepRecord {
                            step: name,
                            status: StepStatus::Succeeded,
                            attempts,
                            duration_ms,
                        });
                    }
                    Err(err) => {
                        blocked.insert(name.clone(), name.clone());
                        steps.push(StepRecord {
                            step: name.clone(),
                            status: StepStatus::Failed {
                                error: err.to_string(),
                            },
                            attempts,
                            duration_ms,
                        });
                        failures.push((name, attempts, err));
                    }
                }
            }

            info!(
                pipeline = %pipeline,
                failed = failures.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "pipeline finished"
            );

            Ok(PipelineReport {
                pipeline: pipeline.to_string(),
                steps,
                outputs: ctx,
                failures,
            })
        }
        .instrument(span)
        .await
    }

    async fn run_step(&self, step: &dyn Step, ctx: &StepContext) -> (u32, Result<StepOutput, StepError>) {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            obs::emit_step_started(step.name(), attempt);
            let result = match self.step_timeout {
                Some(limit) => tokio::time::timeout(limit, step.run(ctx))
                    .await
                    .unwrap_or(Err(StepError::TimedOut {
                        limit_ms: limit.as_millis() as u64,
                    })),
                None => step.run(ctx).await,
            };

            match result {
                Ok(output) => return (attempt, Ok(output)),
                Err(err) => {
                    let will_retry = err.is_transient() && attempt < max_attempts;
                    obs::emit_step_failed(step.name(), attempt, will_retry, &err);
                    if !will_retry {
                        return (attempt, Err(err));
                    }
                    let delay = Duration::from_millis(self.retry.backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16)));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
