//! Execution graph model consumed by the orchestrator

pub mod builder;
pub mod graph;
pub mod ids;

pub use builder::{ExecutionGraphBuilder, GraphSpec, StageSpec};
pub use graph::{
    Conduit, ExecutionGraph, ExecutionGroup, ExecutionStage, ExecutionTask, InputSlot, TaskInput,
};
pub use ids::{ConduitId, GroupId, StageId, TaskId};
