//! Execution graph: stages of platform-bound tasks connected by conduits

use crate::core::errors::{CrossflowError, Result};
use crate::plan::ids::{ConduitId, GroupId, StageId, TaskId};
use petgraph::algo::{is_cyclic_directed, tarjan_scc};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;

/// Which input of an operator a conduit feeds
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputSlot {
    #[default]
    Regular,
    /// Consumed once when a loop is entered
    LoopInitialization,
    /// Fed back on every loop iteration
    LoopBody,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    pub conduit: ConduitId,
    #[serde(default)]
    pub slot: InputSlot,
}

/// Smallest operator-level unit inside a stage
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionTask {
    pub id: TaskId,
    /// Operator name resolved by the backend
    pub operator: String,
    #[serde(default)]
    pub inputs: Vec<TaskInput>,
    #[serde(default)]
    pub outputs: Vec<ConduitId>,
    /// Whether the operator is the head of a loop
    #[serde(default)]
    pub loop_head: bool,
}

impl ExecutionTask {
    pub fn new(id: impl Into<TaskId>, operator: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operator: operator.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            loop_head: false,
        }
    }

    /// Consume a conduit through a regular input
    pub fn with_input(self, conduit: impl Into<ConduitId>) -> Self {
        self.with_slot(conduit, InputSlot::Regular)
    }

    /// Consume a conduit through a loop-initialization input
    pub fn with_loop_initialization(self, conduit: impl Into<ConduitId>) -> Self {
        self.with_slot(conduit, InputSlot::LoopInitialization)
    }

    /// Consume a conduit through a loop-body (iteration) input
    pub fn with_loop_body(self, conduit: impl Into<ConduitId>) -> Self {
        self.with_slot(conduit, InputSlot::LoopBody)
    }

    pub fn with_slot(mut self, conduit: impl Into<ConduitId>, slot: InputSlot) -> Self {
        self.inputs.push(TaskInput {
            conduit: conduit.into(),
            slot,
        });
        self
    }

    pub fn with_output(mut self, conduit: impl Into<ConduitId>) -> Self {
        self.outputs.push(conduit.into());
        self
    }

    /// Mark the operator as a loop head
    pub fn as_loop_head(mut self) -> Self {
        self.loop_head = true;
        self
    }

    /// The slot through which this task consumes `conduit`, if it does
    pub fn slot_for(&self, conduit: &ConduitId) -> Option<InputSlot> {
        self.inputs
            .iter()
            .find(|input| &input.conduit == conduit)
            .map(|input| input.slot)
    }
}

/// Data channel from a producing task (or an external source) to its consumers
#[derive(Clone, Debug)]
pub struct Conduit {
    pub id: ConduitId,
    /// `None` marks an external source supplied by the caller
    pub producer: Option<TaskId>,
    pub consumers: Vec<TaskId>,
}

/// Stages that share one backend executor instance
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionGroup {
    pub id: GroupId,
    /// Name of the platform whose executor runs this group
    pub platform: String,
}

/// A maximal group of tasks run atomically by one backend
#[derive(Clone, Debug)]
pub struct ExecutionStage {
    id: StageId,
    group: GroupId,
    tasks: Vec<ExecutionTask>,
    inbound: Vec<ConduitId>,
    outbound: Vec<ConduitId>,
    loop_head: bool,
}

impl ExecutionStage {
    pub fn id(&self) -> &StageId {
        &self.id
    }

    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn tasks(&self) -> &[ExecutionTask] {
        &self.tasks
    }

    pub fn task(&self, id: &TaskId) -> Option<&ExecutionTask> {
        self.tasks.iter().find(|task| &task.id == id)
    }

    /// Conduits consumed by this stage but produced elsewhere
    pub fn inbound_conduits(&self) -> &[ConduitId] {
        &self.inbound
    }

    /// Conduits produced by this stage that leave it
    pub fn outbound_conduits(&self) -> &[ConduitId] {
        &self.outbound
    }

    pub fn is_loop_head(&self) -> bool {
        self.loop_head
    }
}

/// The compiled plan handed to the orchestrator
#[derive(Clone, Debug)]
pub struct ExecutionGraph {
    groups: HashMap<GroupId, ExecutionGroup>,
    stages: Vec<ExecutionStage>,
    stage_index: HashMap<StageId, usize>,
    task_stage: HashMap<TaskId, StageId>,
    conduits: HashMap<ConduitId, Conduit>,
    loop_stages: HashSet<StageId>,
}

impl ExecutionGraph {
    /// Assemble and validate a graph from its groups and staged tasks
    pub(crate) fn assemble(
        groups: Vec<ExecutionGroup>,
        stages: Vec<(StageId, GroupId, Vec<ExecutionTask>)>,
    ) -> Result<Self> {
        let mut group_map = HashMap::new();
        for group in groups {
            if group_map.contains_key(&group.id) {
                return Err(CrossflowError::invalid_graph(format!(
                    "duplicate group {}",
                    group.id
                )));
            }
            group_map.insert(group.id.clone(), group);
        }

        let mut stage_index = HashMap::new();
        let mut task_stage = HashMap::new();
        for (idx, (stage_id, group_id, tasks)) in stages.iter().enumerate() {
            if stage_index.insert(stage_id.clone(), idx).is_some() {
                return Err(CrossflowError::invalid_graph(format!(
                    "duplicate stage {}",
                    stage_id
                )));
            }
            if !group_map.contains_key(group_id) {
                return Err(CrossflowError::invalid_graph(format!(
                    "stage {} refers to unknown group {}",
                    stage_id, group_id
                )));
            }
            if tasks.is_empty() {
                return Err(CrossflowError::invalid_graph(format!(
                    "stage {} has no tasks",
                    stage_id
                )));
            }
            for task in tasks {
                if task_stage.insert(task.id.clone(), stage_id.clone()).is_some() {
                    return Err(CrossflowError::invalid_graph(format!(
                        "duplicate task {}",
                        task.id
                    )));
                }
                if !task.loop_head && task.inputs.iter().any(|i| i.slot != InputSlot::Regular) {
                    return Err(CrossflowError::invalid_graph(format!(
                        "task {} uses loop inputs but is not a loop head",
                        task.id
                    )));
                }
            }
        }

        let mut conduits: HashMap<ConduitId, Conduit> = HashMap::new();
        for (_, _, tasks) in &stages {
            for task in tasks {
                for output in &task.outputs {
                    let conduit = conduits.entry(output.clone()).or_insert_with(|| Conduit {
                        id: output.clone(),
                        producer: None,
                        consumers: Vec::new(),
                    });
                    if let Some(existing) = &conduit.producer {
                        return Err(CrossflowError::invalid_graph(format!(
                            "conduit {} is produced by both {} and {}",
                            output, existing, task.id
                        )));
                    }
                    conduit.producer = Some(task.id.clone());
                }
                for input in &task.inputs {
                    let conduit = conduits
                        .entry(input.conduit.clone())
                        .or_insert_with(|| Conduit {
                            id: input.conduit.clone(),
                            producer: None,
                            consumers: Vec::new(),
                        });
                    if !conduit.consumers.contains(&task.id) {
                        conduit.consumers.push(task.id.clone());
                    }
                }
            }
        }

        let mut built = Vec::with_capacity(stages.len());
        for (stage_id, group_id, tasks) in stages {
            let produced_here = |conduit: &ConduitId| {
                conduits
                    .get(conduit)
                    .and_then(|c| c.producer.as_ref())
                    .and_then(|producer| task_stage.get(producer))
                    == Some(&stage_id)
            };

            let mut inbound: Vec<ConduitId> = Vec::new();
            for input in tasks.iter().flat_map(|t| t.inputs.iter()) {
                if !produced_here(&input.conduit) && !inbound.contains(&input.conduit) {
                    inbound.push(input.conduit.clone());
                }
            }

            let mut outbound: Vec<ConduitId> = Vec::new();
            for output in tasks.iter().flat_map(|t| t.outputs.iter()) {
                let consumers = &conduits[output].consumers;
                let leaves_stage = consumers.is_empty()
                    || consumers
                        .iter()
                        .any(|consumer| task_stage.get(consumer) != Some(&stage_id));
                if leaves_stage && !outbound.contains(output) {
                    outbound.push(output.clone());
                }
            }

            let loop_head = tasks.iter().any(|t| t.loop_head);
            built.push(ExecutionStage {
                id: stage_id,
                group: group_id,
                tasks,
                inbound,
                outbound,
                loop_head,
            });
        }

        let mut graph = Self {
            groups: group_map,
            stages: built,
            stage_index,
            task_stage,
            conduits,
            loop_stages: HashSet::new(),
        };
        graph.check_acyclic()?;
        graph.loop_stages = graph.find_loop_stages();
        Ok(graph)
    }

    /// Stage dependency graph; loop-body edges into loop heads only when `back_edges` is set
    fn dependencies(&self, back_edges: bool) -> DiGraph<&StageId, &ConduitId> {
        let mut deps: DiGraph<&StageId, &ConduitId> = DiGraph::new();
        let nodes: HashMap<&StageId, NodeIndex> = self
            .stages
            .iter()
            .map(|stage| (&stage.id, deps.add_node(&stage.id)))
            .collect();

        for conduit in self.conduits.values() {
            let Some(producer) = &conduit.producer else {
                continue;
            };
            let from = &self.task_stage[producer];
            for consumer in &conduit.consumers {
                let to = &self.task_stage[consumer];
                if from == to {
                    continue;
                }
                let stage = &self.stages[self.stage_index[to]];
                let back_edge = stage
                    .task(consumer)
                    .map(|task| task.loop_head && task.slot_for(&conduit.id) == Some(InputSlot::LoopBody))
                    .unwrap_or(false);
                if back_edges || !back_edge {
                    deps.add_edge(nodes[from], nodes[to], &conduit.id);
                }
            }
        }
        deps
    }

    /// Stage-level cycles are only allowed through loop-body inputs of loop heads
    fn check_acyclic(&self) -> Result<()> {
        if is_cyclic_directed(&self.dependencies(false)) {
            return Err(CrossflowError::invalid_graph(
                "stages form a cycle that does not pass through a loop-body input",
            ));
        }
        Ok(())
    }

    /// Stages on a loop, i.e. stages that may run once per iteration
    fn find_loop_stages(&self) -> HashSet<StageId> {
        let deps = self.dependencies(true);
        tarjan_scc(&deps)
            .into_iter()
            .filter(|component| component.len() > 1)
            .flatten()
            .map(|node| deps[node].clone())
            .collect()
    }

    pub fn is_in_loop(&self, id: &StageId) -> bool {
        self.loop_stages.contains(id)
    }

    pub fn loop_stages(&self) -> &HashSet<StageId> {
        &self.loop_stages
    }

    pub fn stage(&self, id: &StageId) -> Option<&ExecutionStage> {
        self.stage_index.get(id).map(|&idx| &self.stages[idx])
    }

    pub fn contains_stage(&self, id: &StageId) -> bool {
        self.stage_index.contains_key(id)
    }

    /// Stages in declaration order
    pub fn stages(&self) -> impl Iterator<Item = &ExecutionStage> {
        self.stages.iter()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn conduit(&self, id: &ConduitId) -> Option<&Conduit> {
        self.conduits.get(id)
    }

    pub fn group(&self, id: &GroupId) -> Option<&ExecutionGroup> {
        self.groups.get(id)
    }

    pub fn stage_of_task(&self, task: &TaskId) -> Option<&ExecutionStage> {
        self.task_stage.get(task).and_then(|id| self.stage(id))
    }

    /// Distinct stages that consume `conduit`
    pub fn consumer_stages(&self, conduit: &ConduitId) -> Vec<&StageId> {
        let mut stages: Vec<&StageId> = Vec::new();
        if let Some(conduit) = self.conduits.get(conduit) {
            for consumer in &conduit.consumers {
                if let Some(stage) = self.task_stage.get(consumer) {
                    if !stages.contains(&stage) {
                        stages.push(stage);
                    }
                }
            }
        }
        stages
    }

    /// Stages that belong to `group`
    pub fn group_stages(&self, group: &GroupId) -> HashSet<&StageId> {
        self.stages
            .iter()
            .filter(|stage| &stage.group == group)
            .map(|stage| &stage.id)
            .collect()
    }

    /// Multi-line description of a stage's tasks, used for plan logging
    pub fn to_extensive_string(&self, stage: &ExecutionStage) -> String {
        let platform = self
            .group(&stage.group)
            .map(|g| g.platform.as_str())
            .unwrap_or("?");
        let mut out = format!(
            "Stage {} [group {}, platform {}{}]",
            stage.id,
            stage.group,
            platform,
            if stage.loop_head { ", loop head" } else { "" }
        );
        for task in &stage.tasks {
            let inputs: Vec<String> = task
                .inputs
                .iter()
                .map(|input| match input.slot {
                    InputSlot::Regular => input.conduit.to_string(),
                    InputSlot::LoopInitialization => format!("{} (init)", input.conduit),
                    InputSlot::LoopBody => format!("{} (iter)", input.conduit),
                })
                .collect();
            let outputs: Vec<&str> = task.outputs.iter().map(|c| c.as_str()).collect();
            let _ = write!(
                out,
                "\n  {} := {}({}) -> [{}]",
                task.id,
                task.operator,
                inputs.join(", "),
                outputs.join(", ")
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(id: &str) -> ExecutionGroup {
        ExecutionGroup {
            id: GroupId::from(id),
            platform: "local".to_string(),
        }
    }

    fn source_sink() -> ExecutionGraph {
        ExecutionGraph::assemble(
            vec![group("g")],
            vec![
                (
                    StageId::from("A"),
                    GroupId::from("g"),
                    vec![
                        ExecutionTask::new("read", "source").with_output("tmp"),
                        ExecutionTask::new("map", "map").with_input("tmp").with_output("c1"),
                    ],
                ),
                (
                    StageId::from("B"),
                    GroupId::from("g"),
                    vec![ExecutionTask::new("sink", "collect").with_input("c1")],
                ),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_inbound_and_outbound_are_stage_boundaries() {
        let graph = source_sink();
        let a = graph.stage(&StageId::from("A")).unwrap();
        let b = graph.stage(&StageId::from("B")).unwrap();

        assert!(a.inbound_conduits().is_empty());
        assert_eq!(a.outbound_conduits(), &[ConduitId::from("c1")]);
        assert_eq!(b.inbound_conduits(), &[ConduitId::from("c1")]);
        assert!(b.outbound_conduits().is_empty());
        assert_eq!(
            graph.consumer_stages(&ConduitId::from("c1")),
            vec![&StageId::from("B")]
        );
        assert_eq!(graph.stage_of_task(&TaskId::from("map")).unwrap().id(), a.id());
    }

    #[test]
    fn test_unknown_group_rejected() {
        let err = ExecutionGraph::assemble(
            vec![group("g")],
            vec![(
                StageId::from("A"),
                GroupId::from("missing"),
                vec![ExecutionTask::new("t", "op")],
            )],
        )
        .unwrap_err();
        assert!(matches!(err, CrossflowError::InvalidGraph { .. }));
    }

    #[test]
    fn test_two_producers_rejected() {
        let err = ExecutionGraph::assemble(
            vec![group("g")],
            vec![(
                StageId::from("A"),
                GroupId::from("g"),
                vec![
                    ExecutionTask::new("t1", "op").with_output("c"),
                    ExecutionTask::new("t2", "op").with_output("c"),
                ],
            )],
        )
        .unwrap_err();
        assert!(err.to_string().contains("produced by both"));
    }

    #[test]
    fn test_plain_cycle_rejected_but_loop_back_edge_allowed() {
        let cyclic = ExecutionGraph::assemble(
            vec![group("g")],
            vec![
                (
                    StageId::from("A"),
                    GroupId::from("g"),
                    vec![ExecutionTask::new("a", "op").with_input("ba").with_output("ab")],
                ),
                (
                    StageId::from("B"),
                    GroupId::from("g"),
                    vec![ExecutionTask::new("b", "op").with_input("ab").with_output("ba")],
                ),
            ],
        );
        assert!(cyclic.is_err());

        let looping = ExecutionGraph::assemble(
            vec![group("g")],
            vec![
                (
                    StageId::from("L"),
                    GroupId::from("g"),
                    vec![ExecutionTask::new("head", "loop")
                        .as_loop_head()
                        .with_loop_initialization("init")
                        .with_loop_body("feedback")
                        .with_output("body_in")],
                ),
                (
                    StageId::from("Body"),
                    GroupId::from("g"),
                    vec![ExecutionTask::new("step", "op")
                        .with_input("body_in")
                        .with_output("feedback")],
                ),
            ],
        )
        .unwrap();
        assert!(looping.stage(&StageId::from("L")).unwrap().is_loop_head());
        assert!(looping.is_in_loop(&StageId::from("L")));
        assert!(looping.is_in_loop(&StageId::from("Body")));
    }

    #[test]
    fn test_stages_outside_the_loop() {
        let graph = source_sink();
        assert!(graph.loop_stages().is_empty());
    }

    #[test]
    fn test_loop_slots_require_loop_head() {
        let err = ExecutionGraph::assemble(
            vec![group("g")],
            vec![(
                StageId::from("A"),
                GroupId::from("g"),
                vec![ExecutionTask::new("t", "op").with_loop_body("c")],
            )],
        )
        .unwrap_err();
        assert!(err.to_string().contains("not a loop head"));
    }

    #[test]
    fn test_extensive_string_lists_tasks() {
        let graph = source_sink();
        let text = graph.to_extensive_string(graph.stage(&StageId::from("A")).unwrap());
        assert!(text.starts_with("Stage A [group g, platform local]"));
        assert!(text.contains("map := map(tmp) -> [c1]"));
    }
}
