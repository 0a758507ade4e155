//! Lazily created executors, one per execution group

use crate::core::errors::{CrossflowError, Result};
use crate::exec::executor::{Executor, PlatformRegistry};
use crate::plan::graph::{ExecutionGraph, ExecutionStage};
use crate::plan::ids::{GroupId, StageId};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use tracing::debug;

pub struct ExecutorPool {
    platforms: PlatformRegistry,
    executors: HashMap<GroupId, Box<dyn Executor>>,
    finished: HashMap<GroupId, HashSet<StageId>>,
}

impl ExecutorPool {
    pub fn new(platforms: PlatformRegistry) -> Self {
        Self {
            platforms,
            executors: HashMap::new(),
            finished: HashMap::new(),
        }
    }

    pub fn platforms(&self) -> &PlatformRegistry {
        &self.platforms
    }

    /// Name of the platform serving `stage`'s group
    pub fn platform_of<'g>(&self, graph: &'g ExecutionGraph, stage: &ExecutionStage) -> Result<&'g str> {
        graph
            .group(stage.group())
            .map(|group| group.platform.as_str())
            .ok_or_else(|| {
                CrossflowError::invalid_graph(format!(
                    "stage {} refers to unknown group {}",
                    stage.id(),
                    stage.group()
                ))
            })
    }

    /// The executor of `stage`'s group, created on first use
    pub fn executor_for(
        &mut self,
        graph: &ExecutionGraph,
        stage: &ExecutionStage,
    ) -> Result<&mut dyn Executor> {
        let platform_id = self.platform_of(graph, stage)?;
        match self.executors.entry(stage.group().clone()) {
            Entry::Occupied(entry) => Ok(entry.into_mut().as_mut()),
            Entry::Vacant(entry) => {
                let platform = self.platforms.get(platform_id).ok_or_else(|| {
                    CrossflowError::configuration_field(
                        format!(
                            "no platform {} registered for group {}",
                            platform_id,
                            stage.group()
                        ),
                        "platform",
                    )
                })?;
                let executor = platform.executor_factory().create().map_err(|e| {
                    CrossflowError::stage_execution(
                        stage.id().as_str(),
                        stage.group().as_str(),
                        platform_id,
                        e,
                    )
                    .with_context("phase", "executor creation")
                })?;
                debug!(group = %stage.group(), platform = platform.name(), "Created executor");
                Ok(entry.insert(executor).as_mut())
            }
        }
    }

    /// Record that `stage` completed; returns whether its whole group is done
    pub fn note_completed(&mut self, graph: &ExecutionGraph, stage: &ExecutionStage) -> bool {
        let finished = self.finished.entry(stage.group().clone()).or_default();
        finished.insert(stage.id().clone());
        graph
            .group_stages(stage.group())
            .iter()
            .all(|id| finished.contains(*id))
    }

    /// Dispose and drop the executor of `group`, if one is cached
    pub fn dispose_group(&mut self, group: &GroupId) -> bool {
        match self.executors.remove(group) {
            Some(mut executor) => {
                executor.dispose();
                debug!(group = %group, "Disposed executor");
                true
            }
            None => false,
        }
    }

    /// Dispose every cached executor; returns how many were disposed
    pub fn shutdown(&mut self) -> usize {
        let groups: Vec<GroupId> = self.executors.keys().cloned().collect();
        groups
            .iter()
            .filter(|group| self.dispose_group(group))
            .count()
    }

    pub fn is_active(&self, group: &GroupId) -> bool {
        self.executors.contains_key(group)
    }

    /// Groups that currently hold an executor
    pub fn active_groups(&self) -> Vec<&GroupId> {
        let mut groups: Vec<&GroupId> = self.executors.keys().collect();
        groups.sort();
        groups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::executor::SimplePlatform;
    use crate::plan::builder::StageSpec;
    use crate::plan::graph::ExecutionTask;
    use crate::state::registry::HandleRegistry;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingExecutor {
        disposed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Executor for CountingExecutor {
        async fn execute(
            &mut self,
            _stage: &ExecutionStage,
            _state: &mut HandleRegistry,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn dispose(&mut self) {
            self.disposed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (ExecutorPool, ExecutionGraph, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let disposed = Arc::new(AtomicUsize::new(0));
        let (c, d) = (created.clone(), disposed.clone());
        let platforms = PlatformRegistry::new();
        platforms
            .register(Arc::new(SimplePlatform::new(
                "mock",
                move || -> anyhow::Result<Box<dyn Executor>> {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(Box::new(CountingExecutor { disposed: d.clone() }))
                },
            )))
            .unwrap();

        let graph = ExecutionGraph::builder()
            .group("g1", "mock")
            .group("g2", "missing")
            .stage(StageSpec::new("A", "g1").with_task(ExecutionTask::new("a", "op").with_output("c1")))
            .stage(StageSpec::new("B", "g1").with_task(ExecutionTask::new("b", "op").with_input("c1")))
            .stage(StageSpec::new("C", "g2").with_task(ExecutionTask::new("c", "op")))
            .build()
            .unwrap();
        (ExecutorPool::new(platforms), graph, created, disposed)
    }

    #[test]
    fn test_one_executor_per_group() {
        let (mut pool, graph, created, _) = setup();
        let a = graph.stage(&StageId::from("A")).unwrap();
        let b = graph.stage(&StageId::from("B")).unwrap();

        pool.executor_for(&graph, a).unwrap();
        pool.executor_for(&graph, b).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.active_groups(), vec![&GroupId::from("g1")]);
    }

    #[test]
    fn test_group_completion_and_disposal() {
        let (mut pool, graph, _, disposed) = setup();
        let a = graph.stage(&StageId::from("A")).unwrap();
        let b = graph.stage(&StageId::from("B")).unwrap();
        pool.executor_for(&graph, a).unwrap();

        assert!(!pool.note_completed(&graph, a));
        assert!(pool.note_completed(&graph, b));
        assert!(pool.dispose_group(a.group()));
        assert!(!pool.dispose_group(a.group()));
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(!pool.is_active(a.group()));
    }

    #[test]
    fn test_unknown_platform() {
        let (mut pool, graph, _, _) = setup();
        let c = graph.stage(&StageId::from("C")).unwrap();
        let err = pool.executor_for(&graph, c).err().unwrap();
        assert!(matches!(err, CrossflowError::Configuration { .. }));
    }

    #[test]
    fn test_shutdown_disposes_everything() {
        let (mut pool, graph, _, disposed) = setup();
        pool.executor_for(&graph, graph.stage(&StageId::from("A")).unwrap())
            .unwrap();
        assert_eq!(pool.shutdown(), 1);
        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert!(pool.active_groups().is_empty());
    }
}
