//! Per-entity processors, one module per entity type
//!
//! Registered in dependency order: germplasm, location, trial, study,
//! observation unit, dataset, observation. The order matters for the post
//! phase (an observation unit needs its study's id before it is created) and
//! is fixed once at registry construction.

pub mod dataset;
pub mod germplasm;
pub mod location;
pub mod observation;
pub mod observation_unit;
pub mod study;
pub mod trial;

use crate::error::ImportResult;
use crate::pipeline::processor::Processor;
use crate::store::{EntityRecord, ExternalStore};
use crate::types::{EntityType, ProgramId};

/// The ordered processor registry used by the pipeline manager
pub fn default_processors() -> Vec<Box<dyn Processor>> {
    vec![
        Box::new(germplasm::GermplasmProcessor),
        Box::new(location::LocationProcessor),
        Box::new(trial::TrialProcessor),
        Box::new(study::StudyProcessor),
        Box::new(observation_unit::ObservationUnitProcessor),
        Box::new(dataset::DatasetProcessor),
        Box::new(observation::ObservationProcessor),
    ]
}

/// Create records through the store in submission order, chunked by the
/// invocation's batch size; returned records line up with the input
pub(crate) async fn create_in_batches(
    store: &dyn ExternalStore,
    program: &ProgramId,
    entity: EntityType,
    records: Vec<EntityRecord>,
    batch_size: usize,
) -> ImportResult<Vec<EntityRecord>> {
    let mut created = Vec::with_capacity(records.len());
    let mut remaining = records;
    while !remaining.is_empty() {
        let tail = remaining.split_off(remaining.len().min(batch_size));
        let chunk = std::mem::replace(&mut remaining, tail);
        created.extend(store.create(program, entity, chunk).await?);
    }
    Ok(created)
}
