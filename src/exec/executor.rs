//! Backend executor interfaces and the platform registry
//!
//! Each platform contributes an [`ExecutorFactory`]. The orchestrator creates
//! one [`Executor`] per execution group through that factory and hands it every
//! stage of the group.

use crate::core::errors::{CrossflowError, Result};
use crate::plan::graph::ExecutionStage;
use crate::state::registry::HandleRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;

/// Runs stages on one backend runtime
#[async_trait]
pub trait Executor: Send {
    /// Run `stage` to completion.
    ///
    /// Inputs are read from `state`; every produced outbound conduit must be
    /// registered there before returning.
    async fn execute(
        &mut self,
        stage: &ExecutionStage,
        state: &mut HandleRegistry,
    ) -> anyhow::Result<()>;

    /// Release backend resources. Called once, when the executor is retired.
    fn dispose(&mut self) {}
}

/// Produces executors for one platform
pub trait ExecutorFactory: Send + Sync {
    fn create(&self) -> anyhow::Result<Box<dyn Executor>>;
}

impl<F> ExecutorFactory for F
where
    F: Fn() -> anyhow::Result<Box<dyn Executor>> + Send + Sync,
{
    fn create(&self) -> anyhow::Result<Box<dyn Executor>> {
        self()
    }
}

/// A backend that execution groups can be assigned to
pub trait Platform: Send + Sync {
    /// Key used by execution groups to refer to this platform
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    fn executor_factory(&self) -> Arc<dyn ExecutorFactory>;
}

/// Platform assembled from an id and a factory
pub struct SimplePlatform {
    id: String,
    name: String,
    factory: Arc<dyn ExecutorFactory>,
}

impl SimplePlatform {
    pub fn new(id: impl Into<String>, factory: impl ExecutorFactory + 'static) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            factory: Arc::new(factory),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Platform for SimplePlatform {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn executor_factory(&self) -> Arc<dyn ExecutorFactory> {
        self.factory.clone()
    }
}

/// Registry of platforms by id
#[derive(Clone, Default)]
pub struct PlatformRegistry {
    platforms: Arc<DashMap<String, Arc<dyn Platform>>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a platform; ids must be unique
    pub fn register(&self, platform: Arc<dyn Platform>) -> Result<()> {
        let id = platform.id().to_string();
        if self.platforms.contains_key(&id) {
            return Err(CrossflowError::configuration(format!(
                "platform {} is already registered",
                id
            )));
        }
        self.platforms.insert(id, platform);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Platform>> {
        self.platforms.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.platforms.contains_key(id)
    }

    /// List all registered platform ids
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.platforms.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }
}
