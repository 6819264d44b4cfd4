//! Per-invocation pipeline context
//!
//! All state built during one pipeline invocation lives here and is dropped
//! with it: pending object maps, per-row associations, accumulated
//! validation errors, statistics. Processors are stateless; sharing a
//! processor across uploads can never leak one upload's state into another.

use crate::cache::ProgramData;
use crate::error::{ImportError, RowError};
use crate::pipeline::pending::{PendingImportObject, PendingState};
use crate::types::{
    Dataset, EntityType, Germplasm, ImportRow, Observation, ObservationKey, ObservationUnit,
    ProgramId, ProgramLocation, Study, Trial,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Whether this invocation reports or commits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Resolve and validate only; report the complete error set and the
    /// would-be creates/updates
    Preview,
    /// Validate, then write NEW/MUTATED objects to the external store
    Commit,
}

/// Natural keys one row resolved to, per entity type
#[derive(Debug, Clone, Default)]
pub struct RowLinks {
    pub germplasm: Option<String>,
    pub location: Option<String>,
    pub trial: Option<String>,
    pub study: Option<String>,
    pub observation_unit: Option<String>,
    pub dataset: Option<String>,
    pub observations: Vec<ObservationKey>,
}

/// NEW/EXISTING/MUTATED tallies for one entity type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCounts {
    pub new: usize,
    pub existing: usize,
    pub mutated: usize,
}

/// Per-entity reconciliation tallies, reported from preview and commit alike
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewStatistics {
    pub entities: BTreeMap<EntityType, EntityCounts>,
}

impl PreviewStatistics {
    fn tally<T>(&mut self, entity: EntityType, pending: &BTreeMap<String, PendingImportObject<T>>) {
        let counts = self.entities.entry(entity).or_default();
        for object in pending.values() {
            match object.state() {
                PendingState::New => counts.new += 1,
                PendingState::Existing => counts.existing += 1,
                PendingState::Mutated => counts.mutated += 1,
            }
        }
    }
}

/// State owned by exactly one pipeline invocation
pub struct ImportContext {
    pub program: ProgramId,
    pub upload_id: Uuid,
    /// Who triggered the upload; recorded in observation change logs
    pub actor_id: String,
    pub mode: ImportMode,
    pub rows: Vec<ImportRow>,
    /// Warm program snapshot taken at pipeline start
    pub snapshot: Arc<ProgramData>,

    // One pending object per natural key per entity type
    pub germplasm: BTreeMap<String, PendingImportObject<Germplasm>>,
    pub locations: BTreeMap<String, PendingImportObject<ProgramLocation>>,
    pub trials: BTreeMap<String, PendingImportObject<Trial>>,
    pub studies: BTreeMap<String, PendingImportObject<Study>>,
    pub observation_units: BTreeMap<String, PendingImportObject<ObservationUnit>>,
    pub datasets: BTreeMap<String, PendingImportObject<Dataset>>,
    pub observations: BTreeMap<ObservationKey, PendingImportObject<Observation>>,

    /// Remote observations fetched for this batch's studies, by slot key.
    /// Raw records, not pendings: only (row, variable) pairs become pendings.
    pub fetched_observations: BTreeMap<ObservationKey, Observation>,

    /// Indexed by row position; filled during the map phase
    pub row_links: Vec<RowLinks>,
    /// Accumulated row/column validation problems (never fail-fast)
    pub row_errors: Vec<RowError>,
    /// Fatal per-entity errors that block that entity's creates without
    /// aborting sibling entity types (pedigree cycles)
    pub entity_errors: Vec<ImportError>,
    /// Maximum records per create call to the external store
    pub post_batch_size: usize,
}

impl ImportContext {
    pub fn new(
        program: ProgramId,
        upload_id: Uuid,
        actor_id: impl Into<String>,
        mode: ImportMode,
        rows: Vec<ImportRow>,
        snapshot: Arc<ProgramData>,
    ) -> Self {
        let row_links = vec![RowLinks::default(); rows.len()];
        Self {
            program,
            upload_id,
            actor_id: actor_id.into(),
            mode,
            rows,
            snapshot,
            germplasm: BTreeMap::new(),
            locations: BTreeMap::new(),
            trials: BTreeMap::new(),
            studies: BTreeMap::new(),
            observation_units: BTreeMap::new(),
            datasets: BTreeMap::new(),
            observations: BTreeMap::new(),
            fetched_observations: BTreeMap::new(),
            row_links,
            row_errors: Vec::new(),
            entity_errors: Vec::new(),
            post_batch_size: 200,
        }
    }

    pub fn add_row_error(
        &mut self,
        row_index: usize,
        entity: EntityType,
        field: Option<&str>,
        message: impl Into<String>,
    ) {
        self.row_errors
            .push(RowError::new(row_index, entity, field, message));
    }

    /// Tally the pending maps into per-entity statistics
    pub fn statistics(&self) -> PreviewStatistics {
        let mut stats = PreviewStatistics::default();
        stats.tally(EntityType::Germplasm, &self.germplasm);
        stats.tally(EntityType::Location, &self.locations);
        stats.tally(EntityType::Trial, &self.trials);
        stats.tally(EntityType::Study, &self.studies);
        stats.tally(EntityType::ObservationUnit, &self.observation_units);
        stats.tally(EntityType::Dataset, &self.datasets);

        let counts = stats.entities.entry(EntityType::Observation).or_default();
        for object in self.observations.values() {
            match object.state() {
                PendingState::New => counts.new += 1,
                PendingState::Existing => counts.existing += 1,
                PendingState::Mutated => counts.mutated += 1,
            }
        }
        stats
    }
}
