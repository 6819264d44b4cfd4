//! Upload progress events
//!
//! Fan-out over a tokio broadcast channel so any number of listeners (UI
//! pollers, log sinks, tests) can watch an upload without back-pressuring
//! the pipeline. Per-processor progress events are throttled; lifecycle
//! events always go out.

use crate::pipeline::context::ImportMode;
use crate::pipeline::processor::Phase;
use crate::types::EntityType;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 256;

/// One event in an upload's lifecycle
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ImportEvent {
    UploadStarted {
        upload_id: Uuid,
        mode: ImportMode,
    },
    PhaseStarted {
        upload_id: Uuid,
        phase: Phase,
    },
    /// Throttled; a burst of fast processors collapses to the first event
    /// in each window
    ProcessorFinished {
        upload_id: Uuid,
        phase: Phase,
        entity: EntityType,
        completed: u64,
        total: u64,
    },
    UploadFinished {
        upload_id: Uuid,
        status_code: u16,
    },
}

pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ImportEvent>,
    throttle: Duration,
    /// Last progress event sent, per upload; uploads throttle independently
    last_progress: Mutex<HashMap<Uuid, Instant>>,
}

impl ProgressBroadcaster {
    pub fn new(throttle: Duration) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            throttle,
            last_progress: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.tx.subscribe()
    }

    /// Send an event; a send with no subscribers is not an error
    pub async fn emit(&self, event: ImportEvent) {
        match &event {
            ImportEvent::ProcessorFinished { upload_id, .. } => {
                let mut last = self.last_progress.lock().await;
                let now = Instant::now();
                if let Some(sent) = last.get(upload_id) {
                    if now.duration_since(*sent) < self.throttle {
                        return;
                    }
                }
                last.insert(*upload_id, now);
            }
            ImportEvent::UploadFinished { upload_id, .. } => {
                self.last_progress.lock().await.remove(upload_id);
            }
            _ => {}
        }
        let _ = self.tx.send(event);
    }
}
