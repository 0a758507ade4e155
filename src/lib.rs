// Shared infrastructure: errors and configuration
pub mod core;

// Execution graph, runtime state and the orchestration loop
pub mod plan;   // Stages, tasks, conduits and groups
pub mod state;  // Data handles and the conduit registry
pub mod exec;   // Activation, breakpoints, executors and the orchestrator

// Backends
pub mod platforms;

// Re-exports for convenience
pub use crate::core::{CrossflowError, OrchestratorConfig, Result};
pub use exec::{
    Breakpoint, CompositeBreakpoint, Executor, ExecutorFactory, FixBreakpoint,
    InstrumentationStrategy, LoggingInstrumentation, NoBreakpoint, NoInstrumentation,
    Orchestrator, OrchestratorBuilder, OutboundInstrumentation, Platform, PlatformRegistry,
    PredicateBreakpoint, RunReport, SimplePlatform,
};
pub use plan::{
    ConduitId, ExecutionGraph, ExecutionStage, ExecutionTask, GroupId, InputSlot, StageId,
    StageSpec, TaskId,
};
pub use platforms::{LocalPlatform, OperatorRegistry};
pub use state::{DataHandle, HandleId, HandleRegistry};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::Arc;

    const PIPELINE: &str = r#"
groups:
  - id: main
    platform: local
stages:
  - id: load
    group: main
    tasks:
      - id: numbers
        operator: range
        outputs: [numbers]
  - id: report
    group: main
    tasks:
      - id: total
        operator: sum
        inputs:
          - conduit: numbers
        outputs: [total]
"#;

    #[tokio::test]
    async fn test_yaml_pipeline_on_local_platform() {
        let operators = OperatorRegistry::new()
            .with("range", |_| Ok(json!([1, 2, 3, 4])))
            .with("sum", |args| {
                let items = args[0]
                    .as_array()
                    .ok_or_else(|| anyhow::anyhow!("expected an array"))?;
                Ok(json!(items.iter().filter_map(Value::as_i64).sum::<i64>()))
            });
        let mut orchestrator = Orchestrator::builder()
            .with_platform(Arc::new(LocalPlatform::new(operators)))
            .build()
            .unwrap();

        let graph = ExecutionGraph::from_yaml_str(PIPELINE).unwrap();
        assert!(orchestrator.execute_until_breakpoint(&graph).await.unwrap());

        assert_eq!(orchestrator.completed_stages().len(), 2);
        assert_eq!(orchestrator.state().cardinality(&ConduitId::from("numbers")), Some(4));
    }
}
