use anyhow::{anyhow, Result};
use crossflow::{
    ExecutionGraph, FixBreakpoint, LocalPlatform, NoBreakpoint, OperatorRegistry, Orchestrator,
    OrchestratorConfig,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::info;

const PIPELINE: &str = include_str!("../pipeline.yaml");

fn strings(value: &Value) -> Result<Vec<String>> {
    value
        .as_array()
        .ok_or_else(|| anyhow!("expected an array, got {}", value))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| anyhow!("expected a string, got {}", v))
        })
        .collect()
}

fn operators() -> OperatorRegistry {
    OperatorRegistry::new()
        .with("split_words", |args| {
            let text = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| anyhow!("split_words needs a text input"))?;
            Ok(json!(text.split_whitespace().collect::<Vec<_>>()))
        })
        .with("lowercase", |args| {
            let words = strings(&args[0])?;
            Ok(json!(words.iter().map(|w| w.to_lowercase()).collect::<Vec<_>>()))
        })
        .with("count", |args| Ok(json!(strings(&args[0])?.len())))
        .with("distinct", |args| {
            let unique: BTreeSet<String> = strings(&args[0])?.into_iter().collect();
            Ok(json!(unique))
        })
        .with("print", |args| {
            for arg in args {
                println!("=> {}", arg);
            }
            Ok(Value::Null)
        })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Set up logging
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(tracing::Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = OrchestratorConfig {
        run_label: Some("word-stats".to_string()),
        log_stage_plans: true,
        ..OrchestratorConfig::default()
    };
    let mut orchestrator = Orchestrator::builder()
        .with_config(config)
        .with_platform(Arc::new(LocalPlatform::new(operators())))
        .with_breakpoint(FixBreakpoint::new().break_before("distinct"))
        .build()?;

    let graph = ExecutionGraph::from_yaml_str(PIPELINE)?;
    orchestrator.provide_input("text", json!("The quick brown fox jumps over the lazy dog The End"))?;

    let finished = orchestrator.execute_until_breakpoint(&graph).await?;
    info!(finished, suspended = ?orchestrator.suspended_stages(), "First run done");

    // Lift the breakpoint and resume where we left off.
    orchestrator.set_breakpoint(NoBreakpoint);
    let finished = orchestrator.execute_until_breakpoint(&graph).await?;
    if let Some(report) = orchestrator.last_report() {
        info!(
            finished,
            executed = report.executed.len(),
            discarded = report.discarded_handles,
            elapsed = ?report.elapsed,
            "Second run done"
        );
    }

    orchestrator.shutdown();
    Ok(())
}
