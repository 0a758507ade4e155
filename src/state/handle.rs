//! Reference-counted data handles stored in an arena
//!
//! Every holder of a handle (the registry, stage activators) takes a reference
//! with [`HandleTable::obtain`] and gives it back exactly once with
//! [`HandleTable::release`]. The release that brings the count to zero discards
//! the handle and drops its payload. Handles stay in the arena after discard so
//! that late accesses are reported instead of silently hitting a recycled slot.

use crate::core::errors::{CrossflowError, Result};
use crate::plan::ids::ConduitId;
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// Stable index of a handle in its [`HandleTable`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(usize);

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Materialized data of one conduit at one point in time
#[derive(Debug)]
pub struct DataHandle {
    id: HandleId,
    conduit: ConduitId,
    payload: Option<Value>,
    references: usize,
    discarded: bool,
}

impl DataHandle {
    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn conduit(&self) -> &ConduitId {
        &self.conduit
    }

    pub fn references(&self) -> usize {
        self.references
    }

    pub fn is_discarded(&self) -> bool {
        self.discarded
    }

    /// The payload, unless the handle was discarded
    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }
}

#[derive(Debug, Default)]
pub struct HandleTable {
    handles: Vec<DataHandle>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unreferenced handle
    pub fn create(&mut self, conduit: ConduitId, payload: Value) -> HandleId {
        let id = HandleId(self.handles.len());
        self.handles.push(DataHandle {
            id,
            conduit,
            payload: Some(payload),
            references: 0,
            discarded: false,
        });
        id
    }

    pub fn next_id(&self) -> HandleId {
        HandleId(self.handles.len())
    }

    pub fn get(&self, id: HandleId) -> Option<&DataHandle> {
        self.handles.get(id.0)
    }

    fn get_mut(&mut self, id: HandleId) -> Result<&mut DataHandle> {
        self.handles
            .get_mut(id.0)
            .ok_or_else(|| CrossflowError::invariant(format!("unknown data handle {}", id)))
    }

    /// Take a reference, returning the new count
    pub fn obtain(&mut self, id: HandleId) -> Result<usize> {
        let handle = self.get_mut(id)?;
        if handle.discarded {
            return Err(CrossflowError::invariant(format!(
                "obtained reference to discarded handle {} of conduit {}",
                id, handle.conduit
            )));
        }
        handle.references += 1;
        Ok(handle.references)
    }

    /// Give a reference back; returns whether this discarded the handle
    pub fn release(&mut self, id: HandleId) -> Result<bool> {
        let handle = self.get_mut(id)?;
        if handle.discarded {
            return Err(CrossflowError::invariant(format!(
                "released discarded handle {} of conduit {}",
                id, handle.conduit
            )));
        }
        if handle.references == 0 {
            return Err(CrossflowError::invariant(format!(
                "released unreferenced handle {} of conduit {}",
                id, handle.conduit
            )));
        }
        handle.references -= 1;
        if handle.references == 0 {
            handle.discarded = true;
            handle.payload = None;
            debug!(handle = %id, conduit = %handle.conduit, "Discarded data handle");
            return Ok(true);
        }
        Ok(false)
    }

    /// Payload of a live handle
    pub fn payload(&self, id: HandleId) -> Result<&Value> {
        let handle = self
            .get(id)
            .ok_or_else(|| CrossflowError::invariant(format!("unknown data handle {}", id)))?;
        handle.payload.as_ref().ok_or_else(|| {
            CrossflowError::invariant(format!(
                "read of discarded handle {} of conduit {}",
                id, handle.conduit
            ))
        })
    }

    /// Handles that have not been discarded
    pub fn live(&self) -> impl Iterator<Item = &DataHandle> {
        self.handles.iter().filter(|handle| !handle.discarded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_discard_on_last_release() {
        let mut table = HandleTable::new();
        let id = table.create(ConduitId::from("c1"), json!([1, 2, 3]));

        assert_eq!(table.obtain(id).unwrap(), 1);
        assert_eq!(table.obtain(id).unwrap(), 2);
        assert!(!table.release(id).unwrap());
        assert_eq!(table.payload(id).unwrap(), &json!([1, 2, 3]));
        assert!(table.release(id).unwrap());

        let handle = table.get(id).unwrap();
        assert!(handle.is_discarded());
        assert!(handle.payload().is_none());
        assert_eq!(table.live().count(), 0);
    }

    #[test]
    fn test_double_discard_is_invariant_violation() {
        let mut table = HandleTable::new();
        let id = table.create(ConduitId::from("c1"), json!(null));
        table.obtain(id).unwrap();
        assert!(table.release(id).unwrap());

        let err = table.release(id).unwrap_err();
        assert!(matches!(err, CrossflowError::InvariantViolation { .. }));
        assert!(table.obtain(id).is_err());
        assert!(table.payload(id).is_err());
    }

    #[test]
    fn test_release_without_reference_is_rejected() {
        let mut table = HandleTable::new();
        let id = table.create(ConduitId::from("c1"), json!(1));
        assert!(table.release(id).is_err());
        // The failed release must not have discarded anything.
        assert!(!table.get(id).unwrap().is_discarded());
    }
}
