//! Per-stage readiness tracking
//!
//! A [`StageActivator`] collects the data handles a stage needs before it can
//! run. Its inbound conduits are classified once, when the activator is
//! created:
//!
//! - [`InboundClass::Ordinary`] conduits must all be materialized.
//! - For loop heads, [`InboundClass::Initialization`] and
//!   [`InboundClass::Iteration`] conduits form two alternative sets: the stage
//!   may run as soon as either set is complete.

use crate::core::errors::Result;
use crate::plan::graph::{ExecutionStage, InputSlot};
use crate::plan::ids::{ConduitId, StageId};
use crate::state::handle::HandleId;
use crate::state::registry::HandleRegistry;
use std::collections::HashMap;

/// How an inbound conduit participates in activation
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InboundClass {
    Ordinary,
    /// Feeds a loop head on loop entry
    Initialization,
    /// Feeds a loop head on every back-edge
    Iteration,
}

#[derive(Debug)]
pub struct StageActivator {
    stage: StageId,
    inbound: Vec<ConduitId>,
    classified: Vec<(ConduitId, InboundClass)>,
    inputs: HashMap<ConduitId, HandleId>,
}

impl StageActivator {
    pub fn new(stage: &ExecutionStage) -> Self {
        Self {
            stage: stage.id().clone(),
            inbound: stage.inbound_conduits().to_vec(),
            classified: Self::classify(stage),
            inputs: HashMap::with_capacity(stage.inbound_conduits().len()),
        }
    }

    /// Classify the inbound conduits of `stage`
    pub fn classify(stage: &ExecutionStage) -> Vec<(ConduitId, InboundClass)> {
        let mut classified: Vec<(ConduitId, InboundClass)> = Vec::new();
        let mut push = |conduit: &ConduitId, class: InboundClass| {
            if !classified.iter().any(|(c, k)| c == conduit && *k == class) {
                classified.push((conduit.clone(), class));
            }
        };

        if !stage.is_loop_head() {
            for conduit in stage.inbound_conduits() {
                push(conduit, InboundClass::Ordinary);
            }
            return classified;
        }

        for conduit in stage.inbound_conduits() {
            for task in stage.tasks() {
                let Some(slot) = task.slot_for(conduit) else {
                    continue;
                };
                let class = match (task.loop_head, slot) {
                    (true, InputSlot::LoopBody) => InboundClass::Iteration,
                    (true, InputSlot::LoopInitialization) => InboundClass::Initialization,
                    _ => InboundClass::Ordinary,
                };
                push(conduit, class);
            }
        }
        classified
    }

    pub fn stage(&self) -> &StageId {
        &self.stage
    }

    /// Conduits of one class, in classification order
    pub fn conduits(&self, class: InboundClass) -> impl Iterator<Item = &ConduitId> {
        self.classified
            .iter()
            .filter(move |(_, k)| *k == class)
            .map(|(conduit, _)| conduit)
    }

    /// Whether this activator was created for the given stage layout
    pub fn matches(&self, stage: &ExecutionStage) -> bool {
        &self.stage == stage.id()
            && self.inbound.as_slice() == stage.inbound_conduits()
            && self.classified == Self::classify(stage)
    }

    /// Pick up newly materialized inputs and report whether the stage may run.
    ///
    /// Every conduit found in the registry is referenced right away, even when
    /// activation is not possible yet, so that the handle survives until this
    /// stage consumes it.
    pub fn update_input_handles(&mut self, registry: &mut HandleRegistry) -> Result<bool> {
        // All three sets are visited unconditionally so each one grabs its handles.
        let ordinary = self.satisfy(InboundClass::Ordinary, registry)?;
        let initialization = self.satisfy(InboundClass::Initialization, registry)?;
        let iteration = self.satisfy(InboundClass::Iteration, registry)?;
        Ok(ordinary && (initialization || iteration))
    }

    fn satisfy(&mut self, class: InboundClass, registry: &mut HandleRegistry) -> Result<bool> {
        let mut all_available = true;
        for (conduit, k) in &self.classified {
            if *k != class || self.inputs.contains_key(conduit) {
                continue;
            }
            match registry.lookup(conduit) {
                Some(handle) => {
                    registry.obtain(handle)?;
                    self.inputs.insert(conduit.clone(), handle);
                }
                None => all_available = false,
            }
        }
        Ok(all_available)
    }

    /// The handle collected for `conduit`, if any
    pub fn input_handle(&self, conduit: &ConduitId) -> Option<HandleId> {
        self.inputs.get(conduit).copied()
    }

    /// Handles collected so far
    pub fn handles(&self) -> impl Iterator<Item = HandleId> + '_ {
        self.inputs.values().copied()
    }

    pub fn held_handles(&self) -> usize {
        self.inputs.len()
    }

    /// Release every collected handle
    pub fn dispose(mut self, registry: &mut HandleRegistry) -> Result<()> {
        for (_, handle) in self.inputs.drain() {
            registry.release(handle)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::builder::StageSpec;
    use crate::plan::graph::{ExecutionGraph, ExecutionTask};
    use serde_json::json;

    fn loop_graph() -> ExecutionGraph {
        ExecutionGraph::builder()
            .group("g", "local")
            .stage(
                StageSpec::new("L", "g").with_task(
                    ExecutionTask::new("head", "loop")
                        .as_loop_head()
                        .with_loop_initialization("i1")
                        .with_loop_body("t1")
                        .with_input("side")
                        .with_output("state"),
                ),
            )
            .stage(
                StageSpec::new("Body", "g").with_task(
                    ExecutionTask::new("step", "op")
                        .with_input("state")
                        .with_output("t1"),
                ),
            )
            .build()
            .unwrap()
    }

    fn activator(graph: &ExecutionGraph, stage: &str) -> StageActivator {
        StageActivator::new(graph.stage(&StageId::from(stage)).unwrap())
    }

    #[test]
    fn test_classification() {
        let graph = loop_graph();
        let l = activator(&graph, "L");
        let ids = |class| l.conduits(class).map(|c| c.as_str()).collect::<Vec<_>>();

        assert_eq!(ids(InboundClass::Initialization), vec!["i1"]);
        assert_eq!(ids(InboundClass::Iteration), vec!["t1"]);
        assert_eq!(ids(InboundClass::Ordinary), vec!["side"]);

        let body = activator(&graph, "Body");
        assert_eq!(
            body.conduits(InboundClass::Ordinary).collect::<Vec<_>>(),
            vec![&ConduitId::from("state")]
        );
    }

    #[test]
    fn test_ordinary_inputs_are_conjunctive() {
        let graph = loop_graph();
        let mut registry = HandleRegistry::new();
        let mut l = activator(&graph, "L");

        registry.materialize("i1", json!(0)).unwrap();
        assert!(!l.update_input_handles(&mut registry).unwrap());
        registry.materialize("side", json!("s")).unwrap();
        assert!(l.update_input_handles(&mut registry).unwrap());
    }

    #[test]
    fn test_loop_head_initialization_or_iteration() {
        let graph = loop_graph();

        // Neither set complete.
        let mut registry = HandleRegistry::new();
        registry.materialize("side", json!("s")).unwrap();
        let mut neither = activator(&graph, "L");
        assert!(!neither.update_input_handles(&mut registry).unwrap());

        // Iteration only.
        registry.materialize("t1", json!(1)).unwrap();
        let mut iteration_only = activator(&graph, "L");
        assert!(iteration_only.update_input_handles(&mut registry).unwrap());
        assert!(iteration_only.input_handle(&ConduitId::from("i1")).is_none());

        // Initialization only.
        let mut registry = HandleRegistry::new();
        registry.materialize("side", json!("s")).unwrap();
        registry.materialize("i1", json!(0)).unwrap();
        let mut init_only = activator(&graph, "L");
        assert!(init_only.update_input_handles(&mut registry).unwrap());
    }

    #[test]
    fn test_pending_inputs_are_referenced_and_released_once() {
        let graph = loop_graph();
        let mut registry = HandleRegistry::new();
        let side = registry.materialize("side", json!("s")).unwrap();
        let mut l = activator(&graph, "L");

        // Not ready, but the available handle is already held.
        assert!(!l.update_input_handles(&mut registry).unwrap());
        assert_eq!(registry.handle(side).unwrap().references(), 2);

        // Re-checking does not take a second reference.
        assert!(!l.update_input_handles(&mut registry).unwrap());
        assert_eq!(registry.handle(side).unwrap().references(), 2);
        assert_eq!(l.held_handles(), 1);

        l.dispose(&mut registry).unwrap();
        assert_eq!(registry.handle(side).unwrap().references(), 1);
    }

    #[test]
    fn test_source_stage_is_ready_immediately() {
        let graph = ExecutionGraph::builder()
            .group("g", "local")
            .stage(StageSpec::new("A", "g").with_task(ExecutionTask::new("read", "source").with_output("c1")))
            .build()
            .unwrap();
        let mut registry = HandleRegistry::new();
        let mut a = activator(&graph, "A");
        assert!(a.update_input_handles(&mut registry).unwrap());
        assert!(a.matches(graph.stage(&StageId::from("A")).unwrap()));
    }

    #[test]
    fn test_changed_slot_invalidates_activator() {
        let graph = loop_graph();
        let l = activator(&graph, "L");

        // Same id and inbound conduits, but "side" now feeds the initialization slot.
        let replanned = ExecutionGraph::builder()
            .group("g", "local")
            .stage(
                StageSpec::new("L", "g").with_task(
                    ExecutionTask::new("head", "loop")
                        .as_loop_head()
                        .with_loop_initialization("i1")
                        .with_loop_body("t1")
                        .with_loop_initialization("side")
                        .with_output("state"),
                ),
            )
            .stage(
                StageSpec::new("Body", "g").with_task(
                    ExecutionTask::new("step", "op")
                        .with_input("state")
                        .with_output("t1"),
                ),
            )
            .build()
            .unwrap();
        let stage = replanned.stage(&StageId::from("L")).unwrap();

        assert_eq!(l.inbound.as_slice(), stage.inbound_conduits());
        assert!(!l.matches(stage));
        assert!(l.matches(graph.stage(&StageId::from("L")).unwrap()));
    }
}
