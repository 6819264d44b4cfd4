//! # PhenoSync Common Library
//!
//! Shared code for PhenoSync services:
//! - Common error type
//! - TOML configuration loading
//! - Logging initialization

pub mod config;
pub mod error;
pub mod logging;

pub use error::{Error, Result};
