// Shared infrastructure for the orchestration engine

pub mod config;
pub mod errors;

pub use config::OrchestratorConfig;
pub use errors::{CrossflowError, Result};
