//! Processor contract: four uniform phases per entity type
//!
//! The pipeline manager runs phases phase-major: every processor completes
//! phase N before any processor starts phase N+1, because validation and
//! dependency checks need all processors' NEW objects staged first.
//!
//! Processors are stateless; everything an invocation builds lives on its
//! [`ImportContext`](super::context::ImportContext).

use crate::error::ImportResult;
use crate::pipeline::context::ImportContext;
use crate::store::ExternalStore;
use crate::types::EntityType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline phase tag, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    FetchExisting,
    MapRows,
    ValidateDependencies,
    Post,
}

impl Phase {
    pub fn label(self) -> &'static str {
        match self {
            Self::FetchExisting => "Fetching existing records",
            Self::MapRows => "Mapping rows",
            Self::ValidateDependencies => "Validating dependencies",
            Self::Post => "Committing records",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One entity type's resolution logic, selected once at registry construction
#[async_trait]
pub trait Processor: Send + Sync {
    /// Entity tag this processor handles
    fn entity_type(&self) -> EntityType;

    /// Phase 1: search the external store for records matching any row's
    /// referenced natural keys and stage them as EXISTING
    async fn fetch_existing(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()>;

    /// Phase 2: per row, reuse an EXISTING/already-NEW object by natural key
    /// or construct a NEW object from row fields; record row associations
    fn map_rows(&self, ctx: &mut ImportContext) -> ImportResult<()>;

    /// Phase 3: check cross-entity references against all processors'
    /// staged objects, accumulating row errors (never fail-fast)
    fn validate_dependencies(&self, ctx: &mut ImportContext);

    /// Phase 4 (commit mode only): write NEW/MUTATED objects through the
    /// store and attach returned remote ids to the same pending instances
    async fn post_data(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
    ) -> ImportResult<()>;
}
