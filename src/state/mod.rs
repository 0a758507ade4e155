//! Runtime data of an orchestration: handles and the conduit registry

pub mod handle;
pub mod registry;

pub use handle::{DataHandle, HandleId, HandleTable};
pub use registry::HandleRegistry;
