//! Step trait and the typed values steps hand to each other.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tasador_core::{IngestSummary, ProcessSummary, PromotionResult, SelectionReport, TrainingReport};

use crate::error::StepError;

/// What the promote step decided.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PromotionOutcome {
    Promoted {
        report: SelectionReport,
        result: PromotionResult,
    },
    /// No version had a usable metric; the pipeline still succeeds.
    NoCandidate { report: SelectionReport },
}

/// Output of a finished step.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", content = "output", rename_all = "snake_case")]
pub enum StepOutput {
    Ingested(IngestSummary),
    Processed(ProcessSummary),
    Trained(TrainingReport),
    Promoted(PromotionOutcome),
}

impl StepOutput {
    pub fn as_ingested(&self) -> Option<&IngestSummary> {
        match self {
            StepOutput::Ingested(summary) => Some(summary),
            _ => None,
        }
    }

    pub fn as_processed(&self) -> Option<&ProcessSummary> {
        match self {
            StepOutput::Processed(summary) => Some(summary),
            _ => None,
        }
    }

    pub fn as_trained(&self) -> Option<&TrainingReport> {
        match self {
            StepOutput::Trained(report) => Some(report),
            _ => None,
        }
    }

    pub fn as_promoted(&self) -> Option<&PromotionOutcome> {
        match self {
            StepOutput::Promoted(outcome) => Some(outcome),
            _ => None,
        }
    }
}

/// Outputs of the steps that have completed so far, keyed by step name.
#[derive(Debug, Default, Serialize)]
#[serde(transparent)]
pub struct StepContext {
    outputs: HashMap<String, StepOutput>,
}

impl StepContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, step: &str) -> Option<&StepOutput> {
        self.outputs.get(step)
    }

    /// Fetch and project an upstream output, failing with `MissingInput`
    /// when it is absent or of another kind.
    pub fn require<'a, T>(
        &'a self,
        step: &str,
        upstream: &str,
        project: impl FnOnce(&'a StepOutput) -> Option<&'a T>,
    ) -> Result<&'a T, StepError> {
        self.outputs
            .get(upstream)
            .and_then(project)
            .ok_or_else(|| StepError::MissingInput {
                step: step.to_string(),
                upstream: upstream.to_string(),
            })
    }

    pub(crate) fn insert(&mut self, step: &str, output: StepOutput) {
        self.outputs.insert(step.to_string(), output);
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

/// One node of the pipeline DAG.
#[async_trait]
pub trait Step: Send + Sync {
    /// Unique name within the graph.
    fn name(&self) -> &str;

    /// Steps that must succeed before this one runs.
    fn depends_on(&self) -> Vec<String> {
        Vec::new()
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepError>;
}
