//! Error types for the import pipeline

use crate::store::StoreError;
use crate::types::EntityType;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One accumulated row/column validation problem
///
/// Validation never stops at the first error; preview mode reports the
/// complete set in one pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub row_index: usize,
    /// Column or field the problem was detected on, when attributable
    pub field: Option<String>,
    pub entity: EntityType,
    pub message: String,
}

impl RowError {
    pub fn new(
        row_index: usize,
        entity: EntityType,
        field: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            row_index,
            field: field.map(str::to_string),
            entity,
            message: message.into(),
        }
    }
}

/// Errors raised by the import pipeline
///
/// Row-level validation problems are not errors in this sense; they
/// accumulate as [`RowError`] values on the invocation context and are
/// reported, while these variants abort the invocation.
#[derive(Debug, Error)]
pub enum ImportError {
    /// External store failure (search or write)
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Germplasm batch contains a parent-reference cycle; zero creates were
    /// issued for germplasm
    #[error("Pedigree cycle among germplasm: {}", names.join(", "))]
    PedigreeCycle { names: Vec<String> },

    /// Invalid pending-object state transition (pipeline invariant breach)
    #[error("Invalid pending state transition: {0}")]
    State(String),
}

pub type ImportResult<T> = Result<T, ImportError>;
