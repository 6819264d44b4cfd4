//! Pending import object state machine
//!
//! Staged in-memory representation of a domain entity awaiting (or
//! reflecting) commit. State transitions are guarded:
//! - `New` is assigned in `map_rows` when no natural-key match exists and
//!   never becomes `Existing`.
//! - `Existing` is assigned in `fetch_existing` and becomes `Mutated` only
//!   through [`PendingImportObject::mutate`], which the observation
//!   reconciler calls for an authorized, logged overwrite.
//!
//! Pending objects belong to exactly one pipeline invocation and are dropped
//! with its context; remote ids are attached to the same instances during
//! the post phase.

use crate::error::ImportError;
use serde::{Deserialize, Serialize};

/// Reconciliation state of a staged entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingState {
    /// Constructed from row fields; will be created remotely on commit
    New,
    /// Matched an already-stored record by natural key; no-op on commit
    Existing,
    /// Existing record with an authorized edit; will be updated on commit
    Mutated,
}

/// A staged entity with its reconciliation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingImportObject<T> {
    state: PendingState,
    pub object: T,
}

impl<T> PendingImportObject<T> {
    /// Stage an object constructed from row fields
    pub fn new_object(object: T) -> Self {
        Self {
            state: PendingState::New,
            object,
        }
    }

    /// Stage an object found in the external store
    pub fn existing(object: T) -> Self {
        Self {
            state: PendingState::Existing,
            object,
        }
    }

    pub fn state(&self) -> PendingState {
        self.state
    }

    pub fn is_new(&self) -> bool {
        self.state == PendingState::New
    }

    /// Replace the staged object with an authorized edit of an existing one
    ///
    /// Only `Existing` objects may be mutated; a `New` object has nothing
    /// stored to overwrite.
    pub fn mutate(&mut self, object: T) -> Result<(), ImportError> {
        match self.state {
            PendingState::Existing => {
                self.state = PendingState::Mutated;
                self.object = object;
                Ok(())
            }
            from => Err(ImportError::State(format!(
                "{:?} -> Mutated is not a legal transition",
                from
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_objects_cannot_be_mutated() {
        let mut pending = PendingImportObject::new_object("a".to_string());
        assert!(pending.mutate("b".to_string()).is_err());
        assert_eq!(pending.state(), PendingState::New);
        assert_eq!(pending.object, "a");
    }

    #[test]
    fn existing_transitions_to_mutated_once() {
        let mut pending = PendingImportObject::existing("stored".to_string());
        pending.mutate("edited".to_string()).unwrap();
        assert_eq!(pending.state(), PendingState::Mutated);
        assert_eq!(pending.object, "edited");

        // A second edit of an already-mutated object is rejected; the
        // reconciler applies at most one overwrite per invocation.
        assert!(pending.mutate("again".to_string()).is_err());
    }
}
