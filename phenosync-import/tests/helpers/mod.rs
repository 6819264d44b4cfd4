//! Shared test fixtures: an in-memory store and row builders
#![allow(dead_code)]

use async_trait::async_trait;
use phenosync_import::cache::ProgramData;
use phenosync_import::events::ProgressBroadcaster;
use phenosync_import::pipeline::manager::{PipelineManager, PipelineReport};
use phenosync_import::progress::{ProgressHandle, ProgressStore};
use phenosync_import::store::{
    EntityRecord, ExternalStore, Page, SearchFilter, StoreError, StoreResult,
};
use phenosync_import::types::{EntityType, ImportRow, ProgramId};
use phenosync_import::{ImportContext, ImportMode, ImportResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

const PAGE_SIZE: usize = 100;

pub fn program() -> ProgramId {
    ProgramId::new("prog-1")
}

/// In-memory [`ExternalStore`] with injectable create failures
#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<BTreeMap<EntityType, Vec<EntityRecord>>>,
    next_id: AtomicUsize,
    pub create_calls: AtomicUsize,
    /// Successful create calls to allow before failing; `None` never fails
    fail_create_after: Mutex<Option<usize>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creates_after(&self, successful_calls: usize) {
        *self.fail_create_after.lock().unwrap() = Some(successful_calls);
    }

    pub fn records_of(&self, entity: EntityType) -> Vec<EntityRecord> {
        self.records
            .lock()
            .unwrap()
            .get(&entity)
            .cloned()
            .unwrap_or_default()
    }

    pub fn count_of(&self, entity: EntityType) -> usize {
        self.records_of(entity).len()
    }

    fn assign_id(&self, entity: EntityType, record: &mut EntityRecord) {
        let id = format!(
            "{}-{}",
            entity.name(),
            self.next_id.fetch_add(1, Ordering::SeqCst) + 1
        );
        set_db_id(record, id);
    }
}

#[async_trait]
impl ExternalStore for InMemoryStore {
    async fn search(
        &self,
        _program: &ProgramId,
        entity: EntityType,
        filter: &SearchFilter,
        page: usize,
    ) -> StoreResult<Page> {
        let records = self.records.lock().unwrap();
        let matched: Vec<EntityRecord> = records
            .get(&entity)
            .map(|all| {
                all.iter()
                    .filter(|r| matches_filter(r, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let total = matched.len();
        let start = page * PAGE_SIZE;
        let page_records = matched
            .into_iter()
            .skip(start)
            .take(PAGE_SIZE)
            .collect();
        Ok(Page {
            records: page_records,
            total,
            page,
        })
    }

    async fn create(
        &self,
        _program: &ProgramId,
        entity: EntityType,
        records: Vec<EntityRecord>,
    ) -> StoreResult<Vec<EntityRecord>> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut allowed = self.fail_create_after.lock().unwrap();
            if let Some(remaining) = allowed.as_mut() {
                if *remaining == 0 {
                    return Err(StoreError::Request("injected create failure".to_string()));
                }
                *remaining -= 1;
            }
        }

        let mut created = Vec::with_capacity(records.len());
        for mut record in records {
            self.assign_id(entity, &mut record);
            created.push(record);
        }
        self.records
            .lock()
            .unwrap()
            .entry(entity)
            .or_default()
            .extend(created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        _program: &ProgramId,
        entity: EntityType,
        id: &str,
        record: EntityRecord,
    ) -> StoreResult<EntityRecord> {
        let mut records = self.records.lock().unwrap();
        let slot = records
            .entry(entity)
            .or_default()
            .iter_mut()
            .find(|r| r.db_id() == Some(id));
        match slot {
            Some(stored) => {
                *stored = record.clone();
                Ok(record)
            }
            None => Err(StoreError::NotFound {
                entity,
                id: id.to_string(),
            }),
        }
    }
}

fn matches_filter(record: &EntityRecord, filter: &SearchFilter) -> bool {
    if filter.is_empty() {
        return true;
    }
    if let Some(name) = record_name(record) {
        if filter.names.iter().any(|n| n == name) {
            return true;
        }
    }
    if let Some(study) = record_study(record) {
        if filter.study_names.iter().any(|s| s == study) {
            return true;
        }
    }
    false
}

fn record_name(record: &EntityRecord) -> Option<&str> {
    match record {
        EntityRecord::Germplasm(g) => Some(&g.name),
        EntityRecord::Location(l) => Some(&l.name),
        EntityRecord::Trial(t) => Some(&t.name),
        EntityRecord::Study(s) => Some(&s.name),
        EntityRecord::ObservationUnit(u) => Some(&u.name),
        EntityRecord::Dataset(_) | EntityRecord::Observation(_) => None,
    }
}

fn record_study(record: &EntityRecord) -> Option<&str> {
    match record {
        EntityRecord::ObservationUnit(u) => Some(&u.study_name),
        EntityRecord::Dataset(d) => Some(&d.study_name),
        EntityRecord::Observation(o) => Some(&o.study_name),
        _ => None,
    }
}

fn set_db_id(record: &mut EntityRecord, id: String) {
    match record {
        EntityRecord::Germplasm(g) => g.db_id = Some(id),
        EntityRecord::Location(l) => l.db_id = Some(id),
        EntityRecord::Trial(t) => t.db_id = Some(id),
        EntityRecord::Study(s) => s.db_id = Some(id),
        EntityRecord::ObservationUnit(u) => u.db_id = Some(id),
        EntityRecord::Dataset(d) => d.db_id = Some(id),
        EntityRecord::Observation(o) => o.db_id = Some(id),
    }
}

pub fn row(index: usize, cells: &[(&str, &str)]) -> ImportRow {
    let mut built = ImportRow {
        row_index: index,
        ..ImportRow::default()
    };
    for (column, value) in cells {
        built.cells.insert(column.to_string(), value.to_string());
    }
    built
}

pub fn overwrite_row(index: usize, cells: &[(&str, &str)], reason: &str) -> ImportRow {
    let mut built = row(index, cells);
    built.overwrite = true;
    built.overwrite_reason = Some(reason.to_string());
    built
}

/// Run the default pipeline over the rows with a cold (empty) snapshot
pub async fn run_pipeline(
    store: &InMemoryStore,
    mode: ImportMode,
    rows: Vec<ImportRow>,
) -> (ImportResult<PipelineReport>, ImportContext) {
    let manager = PipelineManager::with_default_processors();
    let upload_id = Uuid::new_v4();
    let progress = Arc::new(ProgressStore::new());
    progress
        .begin(upload_id, "test upload", manager.work_units(mode))
        .await;
    let handle = ProgressHandle::new(
        upload_id,
        Arc::clone(&progress),
        Arc::new(ProgressBroadcaster::new(Duration::ZERO)),
        manager.work_units(mode),
    );

    let mut ctx = ImportContext::new(
        program(),
        upload_id,
        "tester",
        mode,
        rows,
        Arc::new(ProgramData::default()),
    );
    let result = manager.run(&mut ctx, store, &handle).await;
    (result, ctx)
}
