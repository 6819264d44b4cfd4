//! Upload orchestration
//!
//! Accepts an upload, registers its progress record, and runs the pipeline
//! on a spawned task so the caller gets the upload id back immediately and
//! polls or subscribes for the outcome.

use crate::cache::{BrapiCache, ProgramCache, StoreLoader};
use crate::events::{ImportEvent, ProgressBroadcaster};
use crate::pipeline::context::{ImportContext, ImportMode};
use crate::pipeline::manager::PipelineManager;
use crate::progress::{status, ProgressHandle, ProgressRecord, ProgressStore};
use crate::store::ExternalStore;
use crate::types::{ImportRow, ProgramId};
use phenosync_common::config::TomlConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

/// One upload submission
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub program: ProgramId,
    /// Recorded in observation change logs for authorized overwrites
    pub actor_id: String,
    pub mode: ImportMode,
    pub rows: Vec<ImportRow>,
}

#[derive(Clone)]
pub struct UploadOrchestrator {
    store: Arc<dyn ExternalStore>,
    cache: Arc<BrapiCache>,
    manager: Arc<PipelineManager>,
    progress: Arc<ProgressStore>,
    events: Arc<ProgressBroadcaster>,
    post_batch_size: usize,
}

impl UploadOrchestrator {
    pub fn new(store: Arc<dyn ExternalStore>, config: &TomlConfig) -> Self {
        let cache = Arc::new(ProgramCache::new(
            StoreLoader::new(Arc::clone(&store)),
            config.cache.refresh_workers,
        ));
        Self {
            store,
            cache,
            manager: Arc::new(PipelineManager::with_default_processors()),
            progress: Arc::new(ProgressStore::new()),
            events: Arc::new(ProgressBroadcaster::new(Duration::from_millis(
                config.pipeline.event_throttle_ms,
            ))),
            post_batch_size: config.pipeline.post_batch_size,
        }
    }

    /// Shared program cache, for warm-up at process start
    pub fn cache(&self) -> &Arc<BrapiCache> {
        &self.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.events.subscribe()
    }

    pub async fn progress(&self, upload_id: Uuid) -> Option<ProgressRecord> {
        self.progress.get(upload_id).await
    }

    /// Register the upload and run it on a spawned task
    ///
    /// The progress record exists before this returns, so a poll immediately
    /// after submission observes an in-progress upload rather than a miss.
    pub async fn start_upload(&self, request: UploadRequest) -> Uuid {
        let upload_id = Uuid::new_v4();
        let total = self.manager.work_units(request.mode);
        self.progress
            .begin(upload_id, "Upload received", total)
            .await;
        self.events
            .emit(ImportEvent::UploadStarted {
                upload_id,
                mode: request.mode,
            })
            .await;

        let worker = self.clone();
        tokio::spawn(async move {
            worker.run_upload(upload_id, request).await;
        });
        upload_id
    }

    async fn run_upload(&self, upload_id: Uuid, request: UploadRequest) {
        let program = request.program.clone();
        let snapshot = match self.cache.get(&program).await {
            Ok(snapshot) => snapshot,
            Err(store_error) => {
                error!(
                    upload_id = %upload_id,
                    program = %program,
                    error = %store_error,
                    "Program snapshot load failed"
                );
                self.finish(
                    upload_id,
                    "Could not load program data",
                    status::INTERNAL,
                    Some(serde_json::json!({ "error": store_error.to_string() })),
                )
                .await;
                return;
            }
        };

        let mut ctx = ImportContext::new(
            program.clone(),
            upload_id,
            request.actor_id,
            request.mode,
            request.rows,
            snapshot,
        );
        ctx.post_batch_size = self.post_batch_size;

        let handle = ProgressHandle::new(
            upload_id,
            Arc::clone(&self.progress),
            Arc::clone(&self.events),
            self.manager.work_units(request.mode),
        );

        match self.manager.run(&mut ctx, &*self.store, &handle).await {
            Ok(report) => {
                if report.committed {
                    // Writes went through the store directly; let the cached
                    // snapshot catch up in the background
                    self.cache.schedule_refresh(&program);
                }
                let body = serde_json::to_value(&report).ok();
                let (code, message) = if report.is_clean() {
                    match report.mode {
                        ImportMode::Preview => (status::OK, "Preview complete"),
                        ImportMode::Commit => (status::OK, "Import committed"),
                    }
                } else if report.committed {
                    (status::UNPROCESSABLE, "Import committed with errors")
                } else {
                    (status::UNPROCESSABLE, "Upload has validation errors")
                };
                self.finish(upload_id, message, code, body).await;
            }
            Err(pipeline_error) => {
                error!(
                    upload_id = %upload_id,
                    error = %pipeline_error,
                    "Pipeline aborted"
                );
                if request.mode == ImportMode::Commit {
                    // Records created before the failure stay in place;
                    // refresh so the snapshot reflects them
                    self.cache.schedule_refresh(&program);
                }
                self.finish(
                    upload_id,
                    "Upload failed",
                    status::INTERNAL,
                    Some(serde_json::json!({ "error": pipeline_error.to_string() })),
                )
                .await;
            }
        }
    }

    async fn finish(
        &self,
        upload_id: Uuid,
        message: &str,
        status_code: u16,
        body: Option<serde_json::Value>,
    ) {
        info!(upload_id = %upload_id, status_code, "Upload finished");
        self.progress
            .finish(upload_id, message, status_code, body)
            .await;
        self.events
            .emit(ImportEvent::UploadFinished {
                upload_id,
                status_code,
            })
            .await;
    }
}
