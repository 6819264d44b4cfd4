//! Configuration loading and resolution
//!
//! Settings resolve with ENV → TOML → compiled-default priority:
//! 1. `PHENOSYNC_*` environment variables (highest priority)
//! 2. TOML config file (explicit path, or the platform config directory)
//! 3. Compiled defaults (fallback)

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub cache: CacheConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// Program cache tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of background refresh tasks running at once
    pub refresh_workers: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { refresh_workers: 4 }
    }
}

/// Import pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum records per create/update call to the external store
    pub post_batch_size: usize,
    /// Minimum interval between per-row progress events (milliseconds)
    pub event_throttle_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            post_batch_size: 200,
            event_throttle_ms: 1000,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter ("error", "warn", "info", "debug", "trace")
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl TomlConfig {
    /// Load configuration following the documented priority order
    ///
    /// # Arguments
    /// * `explicit_path` - Config file path override (e.g. from a CLI flag)
    ///
    /// A missing config file is not an error; defaults apply. A present but
    /// unparseable file is an error.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let mut config = match resolve_config_path(explicit_path) {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(&path)?;
                let config: TomlConfig = toml::from_str(&content)
                    .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;
                info!(path = %path.display(), "Configuration loaded from TOML");
                config
            }
            Some(path) => {
                info!(path = %path.display(), "No config file found, using defaults");
                TomlConfig::default()
            }
            None => TomlConfig::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `PHENOSYNC_*` environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<usize>("PHENOSYNC_CACHE_REFRESH_WORKERS") {
            self.cache.refresh_workers = v;
        }
        if let Some(v) = env_parse::<usize>("PHENOSYNC_POST_BATCH_SIZE") {
            self.pipeline.post_batch_size = v;
        }
        if let Some(v) = env_parse::<u64>("PHENOSYNC_EVENT_THROTTLE_MS") {
            self.pipeline.event_throttle_ms = v;
        }
        if let Ok(v) = std::env::var("PHENOSYNC_LOG_LEVEL") {
            if !v.trim().is_empty() {
                self.logging.level = v;
            }
        }
    }

    /// Reject configurations that cannot work at runtime
    fn validate(&self) -> Result<()> {
        if self.cache.refresh_workers == 0 {
            return Err(Error::Config(
                "cache.refresh_workers must be at least 1".to_string(),
            ));
        }
        if self.pipeline.post_batch_size == 0 {
            return Err(Error::Config(
                "pipeline.post_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(var = name, value = %raw, "Ignoring unparseable environment override");
                None
            }
        },
        Err(_) => None,
    }
}

/// Resolve the config file path: explicit path wins, otherwise the platform
/// config directory (`~/.config/phenosync/config.toml` on Linux)
fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return Some(path.to_path_buf());
    }
    dirs::config_dir().map(|d| d.join("phenosync").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = TomlConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.refresh_workers, 4);
        assert_eq!(config.pipeline.post_batch_size, 200);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [cache]
            refresh_workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.refresh_workers, 8);
        assert_eq!(config.pipeline.post_batch_size, 200);
    }

    #[test]
    fn zero_workers_rejected() {
        let config: TomlConfig = toml::from_str(
            r#"
            [cache]
            refresh_workers = 0
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
