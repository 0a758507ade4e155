//! Declarative construction of execution graphs
//!
//! Graphs can be assembled in code through [`ExecutionGraphBuilder`] or loaded
//! from a YAML document shaped like [`GraphSpec`]:
//!
//! ```yaml
//! groups:
//!   - id: g1
//!     platform: local
//! stages:
//!   - id: A
//!     group: g1
//!     tasks:
//!       - id: read
//!         operator: source
//!         outputs: [c1]
//!   - id: B
//!     group: g1
//!     tasks:
//!       - id: sink
//!         operator: collect
//!         inputs:
//!           - conduit: c1
//! ```

use crate::core::errors::Result;
use crate::plan::graph::{ExecutionGraph, ExecutionGroup, ExecutionTask};
use crate::plan::ids::{GroupId, StageId};
use serde::{Deserialize, Serialize};

/// Description of a stage before the graph is assembled
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSpec {
    pub id: StageId,
    pub group: GroupId,
    pub tasks: Vec<ExecutionTask>,
}

impl StageSpec {
    pub fn new(id: impl Into<StageId>, group: impl Into<GroupId>) -> Self {
        Self {
            id: id.into(),
            group: group.into(),
            tasks: Vec::new(),
        }
    }

    /// Add a task
    pub fn with_task(mut self, task: ExecutionTask) -> Self {
        self.tasks.push(task);
        self
    }
}

/// Serializable form of a whole graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSpec {
    pub groups: Vec<ExecutionGroup>,
    pub stages: Vec<StageSpec>,
}

impl GraphSpec {
    pub fn build(self) -> Result<ExecutionGraph> {
        ExecutionGraph::assemble(
            self.groups,
            self.stages
                .into_iter()
                .map(|stage| (stage.id, stage.group, stage.tasks))
                .collect(),
        )
    }
}

/// Fluent builder for [`ExecutionGraph`]
#[derive(Debug, Default)]
pub struct ExecutionGraphBuilder {
    spec: GraphSpec,
}

impl ExecutionGraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an execution group running on `platform`
    pub fn group(mut self, id: impl Into<GroupId>, platform: impl Into<String>) -> Self {
        self.spec.groups.push(ExecutionGroup {
            id: id.into(),
            platform: platform.into(),
        });
        self
    }

    pub fn stage(mut self, stage: StageSpec) -> Self {
        self.spec.stages.push(stage);
        self
    }

    pub fn build(self) -> Result<ExecutionGraph> {
        self.spec.build()
    }
}

impl ExecutionGraph {
    pub fn builder() -> ExecutionGraphBuilder {
        ExecutionGraphBuilder::new()
    }

    /// Load a graph from a YAML [`GraphSpec`]
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let spec: GraphSpec = serde_yaml::from_str(yaml)?;
        spec.build()
    }

    /// Load a graph from a JSON [`GraphSpec`]
    pub fn from_json_str(json: &str) -> Result<Self> {
        let spec: GraphSpec = serde_json::from_str(json)?;
        spec.build()
    }
}
