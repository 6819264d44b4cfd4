//! Phenotype upload import service
//!
//! Reconciles tabular phenotype uploads against an external breeding-data
//! store: a per-program snapshot cache with single-flight loads, a
//! phase-major processor pipeline that stages NEW/EXISTING/MUTATED pending
//! objects per entity, pedigree-ordered germplasm creation, observation
//! value reconciliation with an append-only change log, and an upload
//! orchestrator exposing polled progress and broadcast events.

pub mod cache;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod store;
pub mod types;

pub use error::{ImportError, ImportResult, RowError};
pub use orchestrator::{UploadOrchestrator, UploadRequest};
pub use pipeline::{ImportContext, ImportMode, PipelineManager, PipelineReport};
