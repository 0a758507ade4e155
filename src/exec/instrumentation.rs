//! Hooks invoked right before a stage is executed

use crate::plan::graph::ExecutionStage;
use crate::plan::ids::ConduitId;
use parking_lot::RwLock;
use std::collections::HashSet;

/// Fire-and-forget hook that lets external measurement prepare a stage
pub trait InstrumentationStrategy: Send + Sync {
    fn apply_to(&self, stage: &ExecutionStage);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoInstrumentation;

impl InstrumentationStrategy for NoInstrumentation {
    fn apply_to(&self, _stage: &ExecutionStage) {}
}

/// Marks every outbound conduit of the stages it sees
#[derive(Debug, Default)]
pub struct OutboundInstrumentation {
    marked: RwLock<HashSet<ConduitId>>,
}

impl OutboundInstrumentation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_marked(&self, conduit: &ConduitId) -> bool {
        self.marked.read().contains(conduit)
    }

    pub fn marked(&self) -> Vec<ConduitId> {
        let mut marked: Vec<ConduitId> = self.marked.read().iter().cloned().collect();
        marked.sort();
        marked
    }
}

impl InstrumentationStrategy for OutboundInstrumentation {
    fn apply_to(&self, stage: &ExecutionStage) {
        self.marked
            .write()
            .extend(stage.outbound_conduits().iter().cloned());
    }
}

/// A simple strategy that logs each stage about to run
pub struct LoggingInstrumentation;

impl InstrumentationStrategy for LoggingInstrumentation {
    fn apply_to(&self, stage: &ExecutionStage) {
        tracing::debug!(
            stage = %stage.id(),
            tasks = stage.tasks().len(),
            outbound = stage.outbound_conduits().len(),
            "Instrumenting stage"
        );
    }
}
