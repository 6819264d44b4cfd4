//! External breeding-data store boundary
//!
//! The remote system of record is consumed through this trait as a black box
//! exposing search-by-filter, create, and update. The concrete wire client
//! lives outside this crate; tests supply an in-memory implementation.
//!
//! Operations are keyed by an explicit [`EntityType`] tag and move tagged
//! [`EntityRecord`] variants across the boundary; no dynamic type inspection.

use crate::types::{
    Dataset, EntityType, Germplasm, Observation, ObservationUnit, ProgramId, ProgramLocation,
    Study, Trial,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the external store boundary
///
/// The pipeline makes no transient/permanent distinction today; any store
/// failure during a commit aborts the remaining post phases.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store request failed: {0}")]
    Request(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: EntityType, id: String },

    #[error("Store rejected {entity} payload: {message}")]
    Rejected { entity: EntityType, message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Tagged record moving across the store boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntityRecord {
    Germplasm(Germplasm),
    Location(ProgramLocation),
    Trial(Trial),
    Study(Study),
    ObservationUnit(ObservationUnit),
    Dataset(Dataset),
    Observation(Observation),
}

impl EntityRecord {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Germplasm(_) => EntityType::Germplasm,
            Self::Location(_) => EntityType::Location,
            Self::Trial(_) => EntityType::Trial,
            Self::Study(_) => EntityType::Study,
            Self::ObservationUnit(_) => EntityType::ObservationUnit,
            Self::Dataset(_) => EntityType::Dataset,
            Self::Observation(_) => EntityType::Observation,
        }
    }

    /// Server-assigned id carried by the record, if any
    pub fn db_id(&self) -> Option<&str> {
        match self {
            Self::Germplasm(g) => g.db_id.as_deref(),
            Self::Location(l) => l.db_id.as_deref(),
            Self::Trial(t) => t.db_id.as_deref(),
            Self::Study(s) => s.db_id.as_deref(),
            Self::ObservationUnit(u) => u.db_id.as_deref(),
            Self::Dataset(d) => d.db_id.as_deref(),
            Self::Observation(o) => o.db_id.as_deref(),
        }
    }
}

macro_rules! record_accessor {
    ($fn_name:ident, $variant:ident, $ty:ty) => {
        impl EntityRecord {
            pub fn $fn_name(self) -> Option<$ty> {
                match self {
                    Self::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

record_accessor!(into_germplasm, Germplasm, Germplasm);
record_accessor!(into_location, Location, ProgramLocation);
record_accessor!(into_trial, Trial, Trial);
record_accessor!(into_study, Study, Study);
record_accessor!(into_observation_unit, ObservationUnit, ObservationUnit);
record_accessor!(into_dataset, Dataset, Dataset);
record_accessor!(into_observation, Observation, Observation);

/// Search filter over natural keys
///
/// An empty filter matches every record of the entity type in the program.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchFilter {
    /// Match records whose own name is one of these
    pub names: Vec<String>,
    /// Match records scoped under one of these study names (units, datasets,
    /// observations)
    pub study_names: Vec<String>,
}

impl SearchFilter {
    pub fn by_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
            study_names: Vec::new(),
        }
    }

    pub fn by_studies<I, S>(study_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: Vec::new(),
            study_names: study_names.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty() && self.study_names.is_empty()
    }
}

/// One page of search results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page {
    pub records: Vec<EntityRecord>,
    /// Total matching records across all pages
    pub total: usize,
    pub page: usize,
}

/// External breeding-data store: search-by-filter, create, update
#[async_trait]
pub trait ExternalStore: Send + Sync {
    /// Search one page of records matching the filter
    async fn search(
        &self,
        program: &ProgramId,
        entity: EntityType,
        filter: &SearchFilter,
        page: usize,
    ) -> StoreResult<Page>;

    /// Create records, returning them with server-assigned ids attached.
    /// Returned order matches submitted order.
    async fn create(
        &self,
        program: &ProgramId,
        entity: EntityType,
        records: Vec<EntityRecord>,
    ) -> StoreResult<Vec<EntityRecord>>;

    /// Update one record by its server-assigned id
    async fn update(
        &self,
        program: &ProgramId,
        entity: EntityType,
        id: &str,
        record: EntityRecord,
    ) -> StoreResult<EntityRecord>;
}

/// Drain every page of a search
pub async fn search_all(
    store: &dyn ExternalStore,
    program: &ProgramId,
    entity: EntityType,
    filter: &SearchFilter,
) -> StoreResult<Vec<EntityRecord>> {
    let mut records = Vec::new();
    let mut page = 0;
    loop {
        let result = store.search(program, entity, filter, page).await?;
        let fetched = result.records.len();
        records.extend(result.records);
        if fetched == 0 || records.len() >= result.total {
            break;
        }
        page += 1;
    }
    Ok(records)
}
