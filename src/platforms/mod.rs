//! Backends that execution groups can be bound to

pub mod local;

pub use local::{LocalExecutor, LocalPlatform, OperatorFn, OperatorRegistry, LOCAL_PLATFORM_ID};
