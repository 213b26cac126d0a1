//! Step dependency graph and topological execution order.
//!
//! An edge `A → B` means B depends on A: A must succeed before B may run.
//! Ordering uses Kahn's algorithm with insertion order as the tie-break, so
//! independent steps run in the order they were added.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::{PipelineError, PipelineResult};
use crate::step::Step;

#[derive(Default, Clone)]
pub struct StepGraph {
    steps: Vec<Arc<dyn Step>>,
    index: HashMap<String, usize>,
}

impl StepGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. Dependencies are resolved later by [`plan`], so
    /// steps may be added in any order.
    ///
    /// [`plan`]: StepGraph::plan
    pub fn add(&mut self, step: impl Step + 'static) -> PipelineResult<()> {
        self.add_shared(Arc::new(step))
    }

    pub fn add_shared(&mut self, step: Arc<dyn Step>) -> PipelineResult<()> {
        let name = step.name().to_string();
        if self.index.contains_key(&name) {
            return Err(PipelineError::DuplicateStep(name));
        }
        self.index.insert(name, self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Validate dependencies and return the steps in execution order.
    pub fn plan(&self) -> PipelineResult<Vec<Arc<dyn Step>>> {
        let mut in_degree = vec![0usize; self.steps.len()];
        let mut downstream: Vec<Vec<usize>> = vec![Vec::new(); self.steps.len()];

        for (i, step) in self.steps.iter().enumerate() {
            for dependency in step.depends_on() {
                let &d = self
                    .index
                    .get(&dependency)
                    .ok_or_else(|| PipelineError::UnknownDependency {
                        step: step.name().to_string(),
                        dependency: dependency.clone(),
                    })?;
                downstream[d].push(i);
                in_degree[i] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..self.steps.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(i) = queue.pop_front() {
            order.push(i);
            let mut ready = Vec::new();
            for &next in &downstream[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(next);
                }
            }
            ready.sort_unstable();
            queue.extend(ready);
        }

        if order.len() != self.steps.len() {
            let placed: HashSet<usize> = order.iter().copied().collect();
            let steps = (0..self.steps.len())
                .filter(|i| !placed.contains(i))
                .map(|i| self.steps[i].name().to_string())
                .collect();
            return Err(PipelineError::Cycle { steps });
        }

        Ok(order.into_iter().map(|i| Arc::clone(&self.steps[i])).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StepError;
    use crate::step::{StepContext, StepOutput};
    use async_trait::async_trait;

    struct Named {
        name: &'static str,
        deps: Vec<&'static str>,
    }

    fn step(name: &'static str, deps: &[&'static str]) -> Named {
        Named {
            name,
            deps: deps.to_vec(),
        }
    }

    #[async_trait]
    impl Step for Named {
        fn name(&self) -> &str {
            self.name
        }

        fn depends_on(&self) -> Vec<String> {
            self.deps.iter().map(|d| d.to_string()).collect()
        }

        async fn run(&self, _ctx: &StepContext) -> Result<StepOutput, StepError> {
            Err(StepError::TimedOut { limit_ms: 0 })
        }
    }

    fn names(plan: &[Arc<dyn Step>]) -> Vec<&str> {
        plan.iter().map(|s| s.name()).collect()
    }

    #[test]
    fn chain_added_out_of_order_is_sorted() {
        let mut graph = StepGraph::new();
        graph.add(step("promote", &["train"])).unwrap();
        graph.add(step("train", &["process"])).unwrap();
        graph.add(step("ingest", &[])).unwrap();
        graph.add(step("process", &["ingest"])).unwrap();

        let plan = graph.plan().unwrap();
        assert_eq!(names(&plan), vec!["ingest", "process", "train", "promote"]);
    }

    #[test]
    fn independent_steps_keep_insertion_order() {
        let mut graph = StepGraph::new();
        graph.add(step("b", &[])).unwrap();
        graph.add(step("a", &[])).unwrap();
        graph.add(step("c", &["a", "b"])).unwrap();

        let plan = graph.plan().unwrap();
        assert_eq!(names(&plan), vec!["b", "a", "c"]);
    }

    #[test]
    fn duplicate_name_is_rejected() {
        let mut graph = StepGraph::new();
        graph.add(step("ingest", &[])).unwrap();
        assert!(matches!(
            graph.add(step("ingest", &[])),
            Err(PipelineError::DuplicateStep(ref n)) if n == "ingest"
        ));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let mut graph = StepGraph::new();
        graph.add(step("train", &["process"])).unwrap();
        assert!(matches!(
            graph.plan(),
            Err(PipelineError::UnknownDependency { ref dependency, .. }) if dependency == "process"
        ));
    }

    #[test]
    fn cycle_is_rejected_with_members() {
        let mut graph = StepGraph::new();
        graph.add(step("ingest", &[])).unwrap();
        graph.add(step("a", &["ingest", "b"])).unwrap();
        graph.add(step("b", &["a"])).unwrap();

        match graph.plan() {
            Err(PipelineError::Cycle { steps }) => assert_eq!(steps, vec!["a", "b"]),
            other => panic!("expected cycle, got {:?}", other.map(|p| p.len())),
        }
    }
}
