//! Import resolution pipeline

pub mod context;
pub mod manager;
pub mod pedigree;
pub mod pending;
pub mod processor;
pub mod processors;
pub mod reconcile;
pub mod schema;

pub use context::{ImportContext, ImportMode};
pub use manager::{PipelineManager, PipelineReport};
pub use processor::{Phase, Processor};
