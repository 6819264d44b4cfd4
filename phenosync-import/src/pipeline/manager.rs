//! Phase-major pipeline execution
//!
//! Runs every processor through fetch, map, and validate, then (commit mode
//! only, and only with a clean validation pass) through post. A store
//! failure mid-post aborts the remaining processors and leaves the records
//! already created in place; there is no rollback, and re-running the same
//! upload converges because created records resolve as EXISTING.

use crate::error::{ImportResult, RowError};
use crate::pipeline::context::{ImportContext, ImportMode, PreviewStatistics};
use crate::pipeline::processor::{Phase, Processor};
use crate::pipeline::processors::default_processors;
use crate::progress::ProgressHandle;
use crate::store::ExternalStore;
use serde::Serialize;
use tracing::{debug, info};

/// Outcome of one pipeline invocation
///
/// Returned for preview and commit alike; `committed` distinguishes a clean
/// commit from a refused one. Store failures surface as `Err` from
/// [`PipelineManager::run`] instead.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub mode: ImportMode,
    pub statistics: PreviewStatistics,
    pub row_errors: Vec<RowError>,
    /// Fatal per-entity problems (pedigree cycle); creates for that entity
    /// were withheld while sibling entities proceeded
    pub entity_errors: Vec<String>,
    pub committed: bool,
}

impl PipelineReport {
    pub fn is_clean(&self) -> bool {
        self.row_errors.is_empty() && self.entity_errors.is_empty()
    }
}

pub struct PipelineManager {
    processors: Vec<Box<dyn Processor>>,
}

impl PipelineManager {
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Self {
        Self { processors }
    }

    pub fn with_default_processors() -> Self {
        Self::new(default_processors())
    }

    pub fn processor_count(&self) -> usize {
        self.processors.len()
    }

    /// Work units one invocation reports: processors times phases
    pub fn work_units(&self, mode: ImportMode) -> u64 {
        let phases = match mode {
            ImportMode::Preview => 3,
            ImportMode::Commit => 4,
        };
        (self.processors.len() as u64) * phases
    }

    pub async fn run(
        &self,
        ctx: &mut ImportContext,
        store: &dyn ExternalStore,
        progress: &ProgressHandle,
    ) -> ImportResult<PipelineReport> {
        info!(
            upload_id = %ctx.upload_id,
            program = %ctx.program,
            mode = ?ctx.mode,
            rows = ctx.rows.len(),
            "Pipeline starting"
        );

        progress.phase_started(Phase::FetchExisting).await;
        for processor in &self.processors {
            processor.fetch_existing(ctx, store).await?;
            debug!(entity = %processor.entity_type(), "Fetch phase done");
            progress
                .processor_finished(Phase::FetchExisting, processor.entity_type())
                .await;
        }

        progress.phase_started(Phase::MapRows).await;
        for processor in &self.processors {
            processor.map_rows(ctx)?;
            progress
                .processor_finished(Phase::MapRows, processor.entity_type())
                .await;
        }

        progress.phase_started(Phase::ValidateDependencies).await;
        for processor in &self.processors {
            processor.validate_dependencies(ctx);
            progress
                .processor_finished(Phase::ValidateDependencies, processor.entity_type())
                .await;
        }

        let mut committed = false;
        if ctx.mode == ImportMode::Commit {
            if ctx.row_errors.is_empty() {
                progress.phase_started(Phase::Post).await;
                for processor in &self.processors {
                    processor.post_data(ctx, store).await?;
                    progress
                        .processor_finished(Phase::Post, processor.entity_type())
                        .await;
                }
                committed = true;
            } else {
                info!(
                    upload_id = %ctx.upload_id,
                    errors = ctx.row_errors.len(),
                    "Commit refused, validation errors unresolved"
                );
            }
        }

        let report = PipelineReport {
            mode: ctx.mode,
            statistics: ctx.statistics(),
            row_errors: ctx.row_errors.clone(),
            entity_errors: ctx.entity_errors.iter().map(|e| e.to_string()).collect(),
            committed,
        };
        info!(
            upload_id = %ctx.upload_id,
            committed = report.committed,
            row_errors = report.row_errors.len(),
            entity_errors = report.entity_errors.len(),
            "Pipeline finished"
        );
        Ok(report)
    }
}
