//! In-process backend that runs stages with registered operator functions
//!
//! Every task names an operator. The operator receives the values of the
//! task's inputs, in declaration order, and its result is written to every
//! output conduit of the task. Loop slots of a loop head that are not
//! materialized yet are skipped, so the operator sees the initialization value
//! on the first round and the body value afterwards.

use crate::exec::executor::{Executor, ExecutorFactory, Platform};
use crate::plan::graph::{ExecutionStage, InputSlot};
use crate::plan::ids::ConduitId;
use crate::state::registry::HandleRegistry;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub const LOCAL_PLATFORM_ID: &str = "local";

/// An operator: input values in, one output value out
pub type OperatorFn = Arc<dyn Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync>;

/// Registry of operators by name
#[derive(Clone, Default)]
pub struct OperatorRegistry {
    operators: Arc<RwLock<HashMap<String, OperatorFn>>>,
}

impl OperatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator, replacing any previous one with that name
    pub fn register<F>(&self, name: impl Into<String>, operator: F)
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.operators.write().insert(name.into(), Arc::new(operator));
    }

    pub fn with<F>(self, name: impl Into<String>, operator: F) -> Self
    where
        F: Fn(&[Value]) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, operator);
        self
    }

    pub fn get(&self, name: &str) -> Option<OperatorFn> {
        self.operators.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.operators.read().contains_key(name)
    }

    /// List all registered operator names
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operators.read().keys().cloned().collect();
        names.sort();
        names
    }
}

/// Runs the tasks of a stage one after another in this process
pub struct LocalExecutor {
    operators: OperatorRegistry,
    executed_stages: usize,
}

impl LocalExecutor {
    pub fn new(operators: OperatorRegistry) -> Self {
        Self {
            operators,
            executed_stages: 0,
        }
    }

    pub fn executed_stages(&self) -> usize {
        self.executed_stages
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn execute(
        &mut self,
        stage: &ExecutionStage,
        state: &mut HandleRegistry,
    ) -> anyhow::Result<()> {
        // Values produced by earlier tasks of this stage
        let mut produced: HashMap<ConduitId, Value> = HashMap::new();

        for task in stage.tasks() {
            let operator = self
                .operators
                .get(&task.operator)
                .ok_or_else(|| anyhow!("unknown operator {} in task {}", task.operator, task.id))?;

            let mut arguments = Vec::with_capacity(task.inputs.len());
            for input in &task.inputs {
                let value = produced
                    .get(&input.conduit)
                    .or_else(|| state.value(&input.conduit))
                    .cloned();
                match (value, input.slot) {
                    (Some(value), _) => arguments.push(value),
                    (None, InputSlot::LoopInitialization | InputSlot::LoopBody) if task.loop_head => {}
                    (None, _) => {
                        return Err(anyhow!(
                            "input {} of task {} is not available",
                            input.conduit,
                            task.id
                        ))
                    }
                }
            }

            let result = operator(&arguments)
                .with_context(|| format!("operator {} failed in task {}", task.operator, task.id))?;
            debug!(task = %task.id, operator = %task.operator, "Ran task");

            for output in &task.outputs {
                produced.insert(output.clone(), result.clone());
            }
        }

        for conduit in stage.outbound_conduits() {
            let value = produced
                .remove(conduit)
                .ok_or_else(|| anyhow!("stage {} did not produce {}", stage.id(), conduit))?;
            if let Value::Array(items) = &value {
                state.record_cardinality(conduit.clone(), items.len() as u64);
            }
            state.materialize(conduit.clone(), value)?;
        }

        self.executed_stages += 1;
        Ok(())
    }

    fn dispose(&mut self) {
        debug!(stages = self.executed_stages, "Disposing local executor");
    }
}

/// The in-process platform
#[derive(Clone, Default)]
pub struct LocalPlatform {
    operators: OperatorRegistry,
}

impl LocalPlatform {
    pub fn new(operators: OperatorRegistry) -> Self {
        Self { operators }
    }

    pub fn operators(&self) -> &OperatorRegistry {
        &self.operators
    }
}

impl Platform for LocalPlatform {
    fn id(&self) -> &str {
        LOCAL_PLATFORM_ID
    }

    fn name(&self) -> &str {
        "Local"
    }

    fn executor_factory(&self) -> Arc<dyn ExecutorFactory> {
        let operators = self.operators.clone();
        Arc::new(move || -> anyhow::Result<Box<dyn Executor>> {
            Ok(Box::new(LocalExecutor::new(operators.clone())))
        })
    }
}
