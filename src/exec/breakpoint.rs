//! Breakpoint policies deciding whether to pause before a stage

use crate::plan::graph::ExecutionStage;
use crate::plan::ids::StageId;
use std::collections::HashSet;
use std::sync::Arc;

/// Decides whether execution should pause before running a stage
pub trait Breakpoint: Send + Sync {
    fn requests_break_before(&self, stage: &ExecutionStage) -> bool;
}

/// Never pauses
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBreakpoint;

impl Breakpoint for NoBreakpoint {
    fn requests_break_before(&self, _stage: &ExecutionStage) -> bool {
        false
    }
}

/// Pauses before a fixed set of stages
#[derive(Debug, Default, Clone)]
pub struct FixBreakpoint {
    stages: HashSet<StageId>,
}

impl FixBreakpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn break_before(mut self, stage: impl Into<StageId>) -> Self {
        self.stages.insert(stage.into());
        self
    }

    pub fn stages(&self) -> &HashSet<StageId> {
        &self.stages
    }
}

impl<S: Into<StageId>> FromIterator<S> for FixBreakpoint {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            stages: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl Breakpoint for FixBreakpoint {
    fn requests_break_before(&self, stage: &ExecutionStage) -> bool {
        self.stages.contains(stage.id())
    }
}

/// Pauses whenever a closure says so
pub struct PredicateBreakpoint {
    predicate: Box<dyn Fn(&ExecutionStage) -> bool + Send + Sync>,
}

impl PredicateBreakpoint {
    pub fn new(predicate: impl Fn(&ExecutionStage) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
        }
    }
}

impl Breakpoint for PredicateBreakpoint {
    fn requests_break_before(&self, stage: &ExecutionStage) -> bool {
        (self.predicate)(stage)
    }
}

/// Pauses if any of its members asks to
#[derive(Default)]
pub struct CompositeBreakpoint {
    members: Vec<Arc<dyn Breakpoint>>,
}

impl CompositeBreakpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, breakpoint: Arc<dyn Breakpoint>) {
        self.members.push(breakpoint);
    }

    pub fn with(mut self, breakpoint: Arc<dyn Breakpoint>) -> Self {
        self.add(breakpoint);
        self
    }
}

impl Breakpoint for CompositeBreakpoint {
    fn requests_break_before(&self, stage: &ExecutionStage) -> bool {
        self.members
            .iter()
            .any(|member| member.requests_break_before(stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::builder::StageSpec;
    use crate::plan::graph::{ExecutionGraph, ExecutionTask};

    fn graph() -> ExecutionGraph {
        ExecutionGraph::builder()
            .group("g", "local")
            .stage(StageSpec::new("A", "g").with_task(ExecutionTask::new("a", "source").with_output("c1")))
            .stage(StageSpec::new("B", "g").with_task(ExecutionTask::new("b", "sink").with_input("c1")))
            .build()
            .unwrap()
    }

    #[test]
    fn test_fix_breakpoint() {
        let graph = graph();
        let breakpoint: FixBreakpoint = ["B"].into_iter().collect();
        assert!(!breakpoint.requests_break_before(graph.stage(&StageId::from("A")).unwrap()));
        assert!(breakpoint.requests_break_before(graph.stage(&StageId::from("B")).unwrap()));
    }

    #[test]
    fn test_composite_breakpoint() {
        let graph = graph();
        let composite = CompositeBreakpoint::new()
            .with(Arc::new(NoBreakpoint))
            .with(Arc::new(PredicateBreakpoint::new(|stage| {
                stage.inbound_conduits().is_empty()
            })));
        assert!(composite.requests_break_before(graph.stage(&StageId::from("A")).unwrap()));
        assert!(!composite.requests_break_before(graph.stage(&StageId::from("B")).unwrap()));
    }
}
