//! Upload progress records
//!
//! One record per upload, polled by callers between events. Updates are
//! monotonic: `completed` never moves backward, and once a record reaches a
//! terminal status no later write can change it. The status code doubles as
//! the HTTP status a front end would relay: 202 while running, 200 on
//! success, 422 on validation failure, 500 on store or internal failure.

use crate::events::{ImportEvent, ProgressBroadcaster};
use crate::pipeline::processor::Phase;
use crate::types::EntityType;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub mod status {
    pub const IN_PROGRESS: u16 = 202;
    pub const OK: u16 = 200;
    pub const UNPROCESSABLE: u16 = 422;
    pub const INTERNAL: u16 = 500;

    pub fn is_terminal(code: u16) -> bool {
        code != IN_PROGRESS
    }
}

/// Current progress of one upload
#[derive(Debug, Clone, Serialize)]
pub struct ProgressRecord {
    pub upload_id: Uuid,
    pub message: String,
    /// Work units for this upload: processors times phases
    pub total: u64,
    pub completed: u64,
    pub status_code: u16,
    /// Terminal payload (report or error detail), absent while running
    pub body: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

/// All known upload progress records
#[derive(Default)]
pub struct ProgressStore {
    records: Mutex<HashMap<Uuid, ProgressRecord>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh in-progress record; replaces nothing
    pub async fn begin(&self, upload_id: Uuid, message: impl Into<String>, total: u64) {
        let mut records = self.records.lock().await;
        records.entry(upload_id).or_insert(ProgressRecord {
            upload_id,
            message: message.into(),
            total,
            completed: 0,
            status_code: status::IN_PROGRESS,
            body: None,
            updated_at: Utc::now(),
        });
    }

    /// Advance the record; regressions and writes after a terminal status
    /// are dropped
    pub async fn update(&self, upload_id: Uuid, message: impl Into<String>, completed: u64) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&upload_id) {
            if status::is_terminal(record.status_code) || completed < record.completed {
                return;
            }
            record.message = message.into();
            record.completed = completed;
            record.updated_at = Utc::now();
        }
    }

    /// Move the record to a terminal status; the first terminal write wins
    pub async fn finish(
        &self,
        upload_id: Uuid,
        message: impl Into<String>,
        status_code: u16,
        body: Option<serde_json::Value>,
    ) {
        let mut records = self.records.lock().await;
        if let Some(record) = records.get_mut(&upload_id) {
            if status::is_terminal(record.status_code) {
                return;
            }
            record.message = message.into();
            record.status_code = status_code;
            record.body = body;
            if status_code == status::OK {
                record.completed = record.total;
            }
            record.updated_at = Utc::now();
        }
    }

    pub async fn get(&self, upload_id: Uuid) -> Option<ProgressRecord> {
        let records = self.records.lock().await;
        records.get(&upload_id).cloned()
    }
}

/// Per-upload progress writer handed to the pipeline manager
///
/// Owns the work-unit counter and fans every change out to both the record
/// store and the event channel.
pub struct ProgressHandle {
    upload_id: Uuid,
    store: Arc<ProgressStore>,
    events: Arc<ProgressBroadcaster>,
    total: u64,
    completed: AtomicU64,
}

impl ProgressHandle {
    pub fn new(
        upload_id: Uuid,
        store: Arc<ProgressStore>,
        events: Arc<ProgressBroadcaster>,
        total: u64,
    ) -> Self {
        Self {
            upload_id,
            store,
            events,
            total,
            completed: AtomicU64::new(0),
        }
    }

    pub fn upload_id(&self) -> Uuid {
        self.upload_id
    }

    pub async fn phase_started(&self, phase: Phase) {
        let completed = self.completed.load(Ordering::SeqCst);
        self.store
            .update(self.upload_id, phase.label(), completed)
            .await;
        self.events
            .emit(ImportEvent::PhaseStarted {
                upload_id: self.upload_id,
                phase,
            })
            .await;
    }

    pub async fn processor_finished(&self, phase: Phase, entity: EntityType) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.store
            .update(
                self.upload_id,
                format!("{}: {}", phase.label(), entity.name()),
                completed,
            )
            .await;
        self.events
            .emit(ImportEvent::ProcessorFinished {
                upload_id: self.upload_id,
                phase,
                entity,
                completed,
                total: self.total,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completed_never_regresses() {
        let store = ProgressStore::new();
        let id = Uuid::new_v4();
        store.begin(id, "start", 10).await;
        store.update(id, "five", 5).await;
        store.update(id, "stale", 3).await;

        let record = store.get(id).await.unwrap();
        assert_eq!(record.completed, 5);
        assert_eq!(record.message, "five");
    }

    #[tokio::test]
    async fn terminal_status_is_final() {
        let store = ProgressStore::new();
        let id = Uuid::new_v4();
        store.begin(id, "start", 10).await;
        store.finish(id, "done", status::OK, None).await;
        store
            .finish(id, "late failure", status::INTERNAL, None)
            .await;
        store.update(id, "late progress", 9).await;

        let record = store.get(id).await.unwrap();
        assert_eq!(record.status_code, status::OK);
        assert_eq!(record.message, "done");
        // Success snaps completed to total
        assert_eq!(record.completed, record.total);
    }

    #[tokio::test]
    async fn unknown_upload_has_no_record() {
        let store = ProgressStore::new();
        assert!(store.get(Uuid::new_v4()).await.is_none());
    }
}
