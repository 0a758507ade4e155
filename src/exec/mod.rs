//! Stage activation, backend executors and the orchestration loop

pub mod activator;
pub mod breakpoint;
pub mod executor;
pub mod instrumentation;
pub mod orchestrator;
pub mod pool;

pub use activator::{InboundClass, StageActivator};
pub use breakpoint::{Breakpoint, CompositeBreakpoint, FixBreakpoint, NoBreakpoint, PredicateBreakpoint};
pub use executor::{Executor, ExecutorFactory, Platform, PlatformRegistry, SimplePlatform};
pub use instrumentation::{
    InstrumentationStrategy, LoggingInstrumentation, NoInstrumentation, OutboundInstrumentation,
};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunReport};
pub use pool::ExecutorPool;
