//! Maps each conduit to its currently materialized data handle

use crate::core::errors::{CrossflowError, Result};
use crate::plan::ids::ConduitId;
use crate::state::handle::{DataHandle, HandleId, HandleTable};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

/// Registry of current data handles, shared by the orchestrator and the backends.
///
/// The registry holds one reference to every handle it lists as current.
#[derive(Debug, Default)]
pub struct HandleRegistry {
    table: HandleTable,
    current: HashMap<ConduitId, HandleId>,
    cardinalities: HashMap<ConduitId, u64>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current handle of `conduit`, if it has been materialized
    pub fn lookup(&self, conduit: &ConduitId) -> Option<HandleId> {
        self.current.get(conduit).copied()
    }

    /// Create a new handle for `conduit` without registering it
    pub fn create_handle(&mut self, conduit: impl Into<ConduitId>, payload: Value) -> HandleId {
        self.table.create(conduit.into(), payload)
    }

    /// Make `handle` current for its conduit, releasing whatever it supersedes
    pub fn register(&mut self, handle: HandleId) -> Result<()> {
        let conduit = match self.table.get(handle) {
            Some(h) if !h.is_discarded() => h.conduit().clone(),
            Some(_) => {
                return Err(CrossflowError::invariant(format!(
                    "registered discarded handle {}",
                    handle
                )))
            }
            None => {
                return Err(CrossflowError::invariant(format!(
                    "registered unknown handle {}",
                    handle
                )))
            }
        };

        if self.current.get(&conduit) == Some(&handle) {
            return Ok(());
        }
        self.table.obtain(handle)?;
        if let Some(old) = self.current.insert(conduit.clone(), handle) {
            debug!(conduit = %conduit, old = %old, new = %handle, "Superseding data handle");
            self.table.release(old)?;
        }
        Ok(())
    }

    /// Create and register a handle in one step
    pub fn materialize(&mut self, conduit: impl Into<ConduitId>, payload: Value) -> Result<HandleId> {
        let handle = self.create_handle(conduit, payload);
        self.register(handle)?;
        Ok(handle)
    }

    /// Payload currently materialized for `conduit`
    pub fn value(&self, conduit: &ConduitId) -> Option<&Value> {
        self.lookup(conduit)
            .and_then(|handle| self.table.payload(handle).ok())
    }

    pub fn payload(&self, handle: HandleId) -> Result<&Value> {
        self.table.payload(handle)
    }

    pub fn handle(&self, handle: HandleId) -> Option<&DataHandle> {
        self.table.get(handle)
    }

    pub fn obtain(&mut self, handle: HandleId) -> Result<usize> {
        self.table.obtain(handle)
    }

    pub fn release(&mut self, handle: HandleId) -> Result<bool> {
        self.table.release(handle)
    }

    /// Drop every current handle that nobody but the registry still references.
    ///
    /// Returns the number of handles discarded.
    pub fn sweep(&mut self) -> Result<usize> {
        let idle: Vec<ConduitId> = self
            .current
            .iter()
            .filter(|(_, handle)| {
                self.table
                    .get(**handle)
                    .map(|h| h.references() == 1)
                    .unwrap_or(false)
            })
            .map(|(conduit, _)| conduit.clone())
            .collect();

        let mut discarded = 0;
        for conduit in idle {
            if let Some(handle) = self.current.remove(&conduit) {
                if self.table.release(handle)? {
                    discarded += 1;
                }
            }
        }
        Ok(discarded)
    }

    /// Id the next created handle will get; every existing handle compares lower
    pub fn next_handle_id(&self) -> HandleId {
        self.table.next_id()
    }

    /// Conduits that currently have a materialized handle
    pub fn materialized(&self) -> impl Iterator<Item = &ConduitId> {
        self.current.keys()
    }

    /// Handles that have not been discarded, registered or not
    pub fn live_handles(&self) -> impl Iterator<Item = &DataHandle> {
        self.table.live()
    }

    /// Record the observed number of elements on a conduit
    pub fn record_cardinality(&mut self, conduit: impl Into<ConduitId>, cardinality: u64) {
        self.cardinalities.insert(conduit.into(), cardinality);
    }

    pub fn cardinality(&self, conduit: &ConduitId) -> Option<u64> {
        self.cardinalities.get(conduit).copied()
    }

    pub fn cardinalities(&self) -> &HashMap<ConduitId, u64> {
        &self.cardinalities
    }
}
