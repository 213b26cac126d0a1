//! The real-estate price pipeline: ingest → process → train → promote.

use std::path::PathBuf;

use async_trait::async_trait;
use tasador_core::{
    ingest, process, Backend, PipelineConfig, PromotionPolicy, StageExecutor, Trainer,
};
use tracing::warn;

use crate::error::{PipelineResult, StepError};
use crate::graph::StepGraph;
use crate::step::{PromotionOutcome, Step, StepContext, StepOutput};

pub const PIPELINE: &str = "estate";
pub const INGEST: &str = "ingest";
pub const PROCESS: &str = "process";
pub const TRAIN: &str = "train";
pub const PROMOTE: &str = "promote";

pub struct IngestStep {
    raw_data: PathBuf,
}

impl IngestStep {
    pub fn new(raw_data: impl Into<PathBuf>) -> Self {
        Self {
            raw_data: raw_data.into(),
        }
    }
}

#[async_trait]
impl Step for IngestStep {
    fn name(&self) -> &str {
        INGEST
    }

    async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepError> {
        Ok(StepOutput::Ingested(ingest(&self.raw_data)?))
    }
}

pub struct ProcessStep {
    output: PathBuf,
}

impl ProcessStep {
    pub fn new(output: impl Into<PathBuf>) -> Self {
        Self { output: output.into() }
    }
}

#[async_trait]
impl Step for ProcessStep {
    fn name(&self) -> &str {
        PROCESS
    }

    fn depends_on(&self) -> Vec<String> {
        vec![INGEST.to_string()]
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let raw = ctx.require(PROCESS, INGEST, StepOutput::as_ingested)?;
        Ok(StepOutput::Processed(process(&raw.path, &self.output)?))
    }
}

pub struct TrainStep {
    trainer: Trainer,
}

impl TrainStep {
    pub fn new(trainer: Trainer) -> Self {
        Self { trainer }
    }
}

#[async_trait]
impl Step for TrainStep {
    fn name(&self) -> &str {
        TRAIN
    }

    fn depends_on(&self) -> Vec<String> {
        vec![PROCESS.to_string()]
    }

    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, StepError> {
        let processed = ctx.require(TRAIN, PROCESS, StepOutput::as_processed)?;
        let report = self.trainer.train(&processed.output).await?;
        Ok(StepOutput::Trained(report))
    }
}

/// Select the best registered version and promote it.
///
/// An empty candidate set is a successful `NoCandidate` outcome. A partial
/// promotion fails the step; retrying it only archives what is left.
pub struct PromoteStep {
    policy: PromotionPolicy,
    executor: StageExecutor,
    model_name: String,
}

impl PromoteStep {
    pub fn new(policy: PromotionPolicy, executor: StageExecutor, model_name: impl Into<String>) -> Self {
        Self {
            policy,
            executor,
            model_name: model_name.into(),
        }
    }
}

#[async_trait]
impl Step for PromoteStep {
    fn name(&self) -> &str {
        PROMOTE
    }

    fn depends_on(&self) -> Vec<String> {
        vec![TRAIN.to_string()]
    }

    async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepError> {
        let report = self.policy.evaluate(&self.model_name).await?;
        let version = match &report.selected {
            Some(candidate) => candidate.version,
            None => {
                warn!(model = %self.model_name, "no promotion candidate, keeping current stages");
                return Ok(StepOutput::Promoted(PromotionOutcome::NoCandidate { report }));
            }
        };
        let result = self.executor.promote(&self.model_name, version).await?;
        Ok(StepOutput::Promoted(PromotionOutcome::Promoted { report, result }))
    }
}

/// Build the four-step graph against `backend`.
pub fn estate_pipeline(backend: &Backend, config: &PipelineConfig) -> PipelineResult<StepGraph> {
    let mut graph = StepGraph::new();
    graph.add(IngestStep::new(&config.raw_data))?;
    graph.add(ProcessStep::new(&config.processed_data))?;
    graph.add(TrainStep::new(backend.trainer(config)))?;
    graph.add(PromoteStep::new(
        backend.policy(&config.metric_key),
        backend.executor(),
        &config.model_name,
    ))?;
    Ok(graph)
}
