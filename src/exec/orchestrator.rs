//! The orchestration loop
//!
//! The [`Orchestrator`] drives an [`ExecutionGraph`] stage by stage:
//!
//! 1. `prepare` creates (or reuses) a [`StageActivator`] for every stage that
//!    has not run yet and activates those whose inputs are already there.
//!    The orchestrator holds a reference on the inputs of stages on a loop so
//!    they survive until the loop cannot iterate anymore.
//! 2. `run_to_breakpoint` pops activated stages, consults the breakpoint,
//!    runs the stage on its group's executor, activates successors and sweeps
//!    handles nobody needs anymore.
//! 3. If a whole pass ran nothing because of breakpoints, one more pass runs
//!    with breakpoints disabled. If that also runs nothing, the graph is
//!    deadlocked.
//!
//! Stages run one at a time; the loop awaits each executor before looking at
//! the next stage. Stages on a loop run again whenever a new iteration
//! produces fresh input for them.

use crate::core::config::OrchestratorConfig;
use crate::core::errors::{CrossflowError, Result};
use crate::exec::activator::{InboundClass, StageActivator};
use crate::exec::breakpoint::{Breakpoint, NoBreakpoint};
use crate::exec::executor::{Platform, PlatformRegistry};
use crate::exec::instrumentation::{InstrumentationStrategy, NoInstrumentation};
use crate::exec::pool::ExecutorPool;
use crate::plan::graph::{ExecutionGraph, ExecutionStage};
use crate::plan::ids::{ConduitId, StageId};
use crate::state::handle::HandleId;
use crate::state::registry::HandleRegistry;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Summary of one `run_to_breakpoint` call
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Stages executed during this run, in execution order
    pub executed: Vec<StageId>,
    /// Stages held back by the breakpoint
    pub suspended: Vec<StageId>,
    /// Stages of the graph that never became ready
    pub stranded: Vec<StageId>,
    pub elapsed: Duration,
    pub safety_net_used: bool,
    pub discarded_handles: usize,
}

impl RunReport {
    fn empty() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            executed: Vec::new(),
            suspended: Vec::new(),
            stranded: Vec::new(),
            elapsed: Duration::ZERO,
            safety_net_used: false,
            discarded_handles: 0,
        }
    }

    /// Whether the run ended without suspended stages
    pub fn completed(&self) -> bool {
        self.suspended.is_empty()
    }
}

/// Executes execution graphs across platforms, pausing at breakpoints
pub struct Orchestrator {
    config: OrchestratorConfig,
    breakpoint: Arc<dyn Breakpoint>,
    instrumentation: Arc<dyn InstrumentationStrategy>,
    registry: HandleRegistry,
    pool: ExecutorPool,
    /// Registered but not yet ready
    pending: HashMap<StageId, StageActivator>,
    /// Ready and queued to run
    activated: VecDeque<StageActivator>,
    /// Ready but held back by the breakpoint
    suspended: Vec<StageActivator>,
    completed: HashSet<StageId>,
    /// First handle id created after each stage last finished
    executed_at: HashMap<StageId, HandleId>,
    /// Conduits that later loop iterations read again
    loop_inputs: HashSet<ConduitId>,
    /// Handles of `loop_inputs` the orchestrator holds a reference on
    loop_holds: HashMap<ConduitId, HandleId>,
    last_report: Option<RunReport>,
}

impl Orchestrator {
    pub fn new(platforms: PlatformRegistry) -> Self {
        Self {
            config: OrchestratorConfig::default(),
            breakpoint: Arc::new(NoBreakpoint),
            instrumentation: Arc::new(NoInstrumentation),
            registry: HandleRegistry::new(),
            pool: ExecutorPool::new(platforms),
            pending: HashMap::new(),
            activated: VecDeque::new(),
            suspended: Vec::new(),
            completed: HashSet::new(),
            executed_at: HashMap::new(),
            loop_inputs: HashSet::new(),
            loop_holds: HashMap::new(),
            last_report: None,
        }
    }

    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Execute `graph` until it completes or the breakpoint pauses it.
    ///
    /// Returns `true` when nothing is left suspended. A paused graph is
    /// resumed by calling this again, with the same graph or a re-planned one.
    pub async fn execute_until_breakpoint(&mut self, graph: &ExecutionGraph) -> Result<bool> {
        self.prepare(graph)?;

        if self.activated.is_empty()
            && graph.stages().all(|stage| self.completed.contains(stage.id()))
        {
            info!("All {} stages already executed", graph.len());
            self.last_report = Some(RunReport::empty());
            return Ok(true);
        }

        let report = self.run_to_breakpoint(graph).await?;
        Ok(report.completed())
    }

    /// Align the activators with `graph` and activate every stage that can run.
    pub fn prepare(&mut self, graph: &ExecutionGraph) -> Result<()> {
        // Queued and suspended stages go back to pending, keeping their handles.
        for activator in self.activated.drain(..).chain(self.suspended.drain(..)) {
            if let Some(stale) = self.pending.insert(activator.stage().clone(), activator) {
                stale.dispose(&mut self.registry)?;
            }
        }

        // Remove activators that do not fit the (possibly re-planned) graph.
        let obsolete: Vec<StageId> = self
            .pending
            .iter()
            .filter(|(id, activator)| match graph.stage(id) {
                Some(stage) => {
                    !activator.matches(stage)
                        || (self.completed.contains(*id) && !graph.is_in_loop(id))
                }
                None => true,
            })
            .map(|(id, _)| id.clone())
            .collect();
        for id in obsolete {
            if let Some(activator) = self.pending.remove(&id) {
                debug!(stage = %id, "Dropping obsolete activator");
                activator.dispose(&mut self.registry)?;
            }
        }

        self.release_loop_inputs()?;
        self.loop_inputs = Self::find_loop_inputs(graph);
        self.hold_loop_inputs()?;

        for stage in graph.stages() {
            // A completed stage only comes back through a loop iteration.
            if self.completed.contains(stage.id()) && !self.pending.contains_key(stage.id()) {
                continue;
            }
            self.get_or_create_activator(stage);
            self.try_to_activate(stage.id())?;
        }
        Ok(())
    }

    /// Inbound conduits of loop stages, except the ones that only enter the loop
    fn find_loop_inputs(graph: &ExecutionGraph) -> HashSet<ConduitId> {
        graph
            .stages()
            .filter(|stage| graph.is_in_loop(stage.id()))
            .flat_map(StageActivator::classify)
            .filter(|(_, class)| *class != InboundClass::Initialization)
            .map(|(conduit, _)| conduit)
            .collect()
    }

    /// Run activated stages until none is left or all remaining ones are suspended
    pub async fn run_to_breakpoint(&mut self, graph: &ExecutionGraph) -> Result<RunReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "run",
            run_id = %run_id,
            label = self.config.run_label.as_deref().unwrap_or("")
        );
        let report = self.run_passes(graph, run_id).instrument(span).await?;
        self.last_report = Some(report.clone());
        Ok(report)
    }

    async fn run_passes(&mut self, graph: &ExecutionGraph, run_id: Uuid) -> Result<RunReport> {
        let started_at = Utc::now();
        let start = Instant::now();
        let mut executed: Vec<StageId> = Vec::new();
        let mut discarded_handles = 0;
        let mut breakpoints_disabled = false;
        let mut safety_net_used = false;

        loop {
            while let Some(activator) = self.activated.pop_front() {
                let Some(stage) = graph.stage(activator.stage()) else {
                    let id = activator.stage().clone();
                    activator.dispose(&mut self.registry)?;
                    return Err(CrossflowError::invariant(format!(
                        "activated stage {} is not part of the graph",
                        id
                    )));
                };
                if let Some(&watermark) = self.executed_at.get(stage.id()) {
                    if !activator.handles().any(|handle| handle >= watermark) {
                        activator.dispose(&mut self.registry)?;
                        return Err(CrossflowError::invariant(format!(
                            "stage {} was activated again without new input",
                            stage.id()
                        )));
                    }
                }

                if !breakpoints_disabled && self.breakpoint.requests_break_before(stage) {
                    debug!(stage = %stage.id(), "Suspending stage at breakpoint");
                    self.suspended.push(activator);
                    continue;
                }

                let outcome = self.execute(graph, stage).await;
                // The activator has served its purpose whether or not the stage succeeded.
                activator.dispose(&mut self.registry)?;
                outcome?;
                executed.push(stage.id().clone());

                self.try_to_activate_successors(graph, stage)?;
                self.hold_loop_inputs()?;
                discarded_handles += self.registry.sweep()?;
            }

            if !breakpoints_disabled && executed.is_empty() && self.config.enable_safety_net {
                warn!(
                    suspended = self.suspended.len(),
                    "Could not execute a single stage. Will retry with disabled breakpoints."
                );
                breakpoints_disabled = true;
                safety_net_used = true;
                self.activated.extend(self.suspended.drain(..));
            } else {
                breakpoints_disabled = false;
            }

            if self.activated.is_empty() {
                break;
            }
        }

        let elapsed = start.elapsed();
        info!("Executed {} stages in {:?}.", executed.len(), elapsed);

        let suspended: Vec<StageId> = self.suspended.iter().map(|a| a.stage().clone()).collect();
        if suspended.is_empty() && !self.loop_holds.is_empty() {
            // No further iteration can start in this run.
            self.release_loop_inputs()?;
            discarded_handles += self.registry.sweep()?;
        }
        let mut stranded: Vec<StageId> = self
            .pending
            .keys()
            .filter(|id| graph.contains_stage(id))
            .cloned()
            .collect();
        stranded.sort();

        if executed.is_empty() && (self.config.enable_safety_net || suspended.is_empty()) {
            let mut waiting = stranded.iter().map(|id| id.to_string()).collect::<Vec<_>>();
            waiting.extend(suspended.iter().map(|id| id.to_string()));
            return Err(CrossflowError::deadlock(
                "could not execute a single stage; are the graph and breakpoints correct?",
                waiting,
            ));
        }
        if suspended.is_empty() && !stranded.is_empty() {
            warn!(stages = ?stranded, "Run finished with stages that never became ready");
        }

        Ok(RunReport {
            run_id,
            started_at,
            executed,
            suspended,
            stranded,
            elapsed,
            safety_net_used,
            discarded_handles,
        })
    }

    async fn execute(&mut self, graph: &ExecutionGraph, stage: &ExecutionStage) -> Result<()> {
        self.instrumentation.apply_to(stage);

        let platform = self.pool.platform_of(graph, stage)?;
        if self.config.log_stage_plans {
            info!("Stage plan:\n{}", graph.to_extensive_string(stage));
        }
        info!(stage = %stage.id(), group = %stage.group(), platform, "Start executing stage");

        let start = Instant::now();
        let executor = self.pool.executor_for(graph, stage)?;
        executor
            .execute(stage, &mut self.registry)
            .await
            .map_err(|e| {
                CrossflowError::stage_execution(
                    stage.id().as_str(),
                    stage.group().as_str(),
                    platform,
                    e,
                )
            })?;
        info!(stage = %stage.id(), elapsed = ?start.elapsed(), "Executed stage");

        self.completed.insert(stage.id().clone());
        self.executed_at
            .insert(stage.id().clone(), self.registry.next_handle_id());
        if self.pool.note_completed(graph, stage) && self.config.dispose_finished_executors {
            self.pool.dispose_group(stage.group());
        }
        Ok(())
    }

    /// Take a reference on the current handle of every loop input
    fn hold_loop_inputs(&mut self) -> Result<()> {
        for conduit in &self.loop_inputs {
            let Some(handle) = self.registry.lookup(conduit) else {
                continue;
            };
            if self.loop_holds.get(conduit) == Some(&handle) {
                continue;
            }
            self.registry.obtain(handle)?;
            if let Some(superseded) = self.loop_holds.insert(conduit.clone(), handle) {
                self.registry.release(superseded)?;
            }
        }
        Ok(())
    }

    fn release_loop_inputs(&mut self) -> Result<()> {
        for (_, handle) in self.loop_holds.drain() {
            self.registry.release(handle)?;
        }
        Ok(())
    }

    fn is_scheduled(&self, stage: &StageId) -> bool {
        self.activated.iter().any(|a| a.stage() == stage)
            || self.suspended.iter().any(|a| a.stage() == stage)
    }

    fn get_or_create_activator(&mut self, stage: &ExecutionStage) {
        if self.is_scheduled(stage.id()) {
            return;
        }
        self.pending
            .entry(stage.id().clone())
            .or_insert_with(|| StageActivator::new(stage));
    }

    /// Move the stage's activator to the activated queue if its inputs allow
    fn try_to_activate(&mut self, stage: &StageId) -> Result<bool> {
        let Some(activator) = self.pending.get_mut(stage) else {
            return Ok(false);
        };
        if !activator.update_input_handles(&mut self.registry)? {
            return Ok(false);
        }
        if let Some(activator) = self.pending.remove(stage) {
            debug!(stage = %stage, "Activated stage");
            self.activated.push_back(activator);
        }
        Ok(true)
    }

    fn try_to_activate_successors(
        &mut self,
        graph: &ExecutionGraph,
        stage: &ExecutionStage,
    ) -> Result<()> {
        let mut successors: Vec<&StageId> = Vec::new();
        for conduit in stage.outbound_conduits() {
            if self.registry.lookup(conduit).is_none() {
                continue;
            }
            for successor in graph.consumer_stages(conduit) {
                if successor != stage.id() && !successors.contains(&successor) {
                    successors.push(successor);
                }
            }
        }

        for successor in successors {
            if self.completed.contains(successor) && !graph.is_in_loop(successor) {
                continue;
            }
            if let Some(successor_stage) = graph.stage(successor) {
                self.get_or_create_activator(successor_stage);
                self.try_to_activate(successor)?;
            }
        }
        Ok(())
    }

    /// Materialize the data of an external source conduit
    pub fn provide_input(&mut self, conduit: impl Into<ConduitId>, payload: Value) -> Result<HandleId> {
        self.registry.materialize(conduit, payload)
    }

    /// Replace the breakpoint consulted by subsequent runs
    pub fn set_breakpoint(&mut self, breakpoint: impl Breakpoint + 'static) {
        self.breakpoint = Arc::new(breakpoint);
    }

    pub fn set_shared_breakpoint(&mut self, breakpoint: Arc<dyn Breakpoint>) {
        self.breakpoint = breakpoint;
    }

    /// Stages executed so far, across all runs
    pub fn completed_stages(&self) -> &HashSet<StageId> {
        &self.completed
    }

    pub fn suspended_stages(&self) -> Vec<&StageId> {
        self.suspended.iter().map(|a| a.stage()).collect()
    }

    pub fn pending_stages(&self) -> Vec<&StageId> {
        let mut stages: Vec<&StageId> = self.pending.keys().collect();
        stages.sort();
        stages
    }

    pub fn state(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn state_mut(&mut self) -> &mut HandleRegistry {
        &mut self.registry
    }

    pub fn executor_pool(&self) -> &ExecutorPool {
        &self.pool
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn last_report(&self) -> Option<&RunReport> {
        self.last_report.as_ref()
    }

    /// Dispose all cached executors
    pub fn shutdown(&mut self) -> usize {
        let disposed = self.pool.shutdown();
        info!("Shut down {} executors", disposed);
        disposed
    }
}

/// Builder for [`Orchestrator`]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    breakpoint: Arc<dyn Breakpoint>,
    instrumentation: Arc<dyn InstrumentationStrategy>,
    platforms: PlatformRegistry,
    extra_platforms: Vec<Arc<dyn Platform>>,
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            breakpoint: Arc::new(NoBreakpoint),
            instrumentation: Arc::new(NoInstrumentation),
            platforms: PlatformRegistry::new(),
            extra_platforms: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_breakpoint(mut self, breakpoint: impl Breakpoint + 'static) -> Self {
        self.breakpoint = Arc::new(breakpoint);
        self
    }

    pub fn with_instrumentation(mut self, instrumentation: Arc<dyn InstrumentationStrategy>) -> Self {
        self.instrumentation = instrumentation;
        self
    }

    /// Use an existing platform registry
    pub fn with_platforms(mut self, platforms: PlatformRegistry) -> Self {
        self.platforms = platforms;
        self
    }

    pub fn with_platform(mut self, platform: Arc<dyn Platform>) -> Self {
        self.extra_platforms.push(platform);
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        self.config.validate()?;
        for platform in self.extra_platforms {
            self.platforms.register(platform)?;
        }
        let mut orchestrator = Orchestrator::new(self.platforms);
        orchestrator.config = self.config;
        orchestrator.breakpoint = self.breakpoint;
        orchestrator.instrumentation = self.instrumentation;
        Ok(orchestrator)
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
