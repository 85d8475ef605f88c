//! Configuration loader with file and environment variable support

use crate::{ConfigError, UnitflowConfig};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};
use uf_common::logging::LogFormat;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "unitflow.toml",
    "config/unitflow.toml",
    "/etc/unitflow/unitflow.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    search_standard_paths: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            search_standard_paths: true,
        }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
            search_standard_paths: true,
        }
    }

    /// Only consider the explicit path and `UNITFLOW_CONFIG`
    pub fn without_standard_paths(mut self) -> Self {
        self.search_standard_paths = false;
        self
    }

    /// Load configuration from file (if found), apply environment overrides,
    /// and validate the result.
    pub fn load(&self) -> Result<UnitflowConfig, ConfigError> {
        let mut config = UnitflowConfig::default();

        if let Some(path) = self.find_config_file() {
            info!(?path, "Loading configuration from file");
            config = UnitflowConfig::from_file(&path)?;
        }

        self.apply_env_overrides(&mut config);
        config.validate()?;

        Ok(config)
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file does not exist, falling back");
        }

        if let Ok(path) = env::var("UNITFLOW_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        if self.search_standard_paths {
            for path in CONFIG_PATHS {
                let path = PathBuf::from(path);
                if path.exists() {
                    return Some(path);
                }
            }
        }

        None
    }

    fn apply_env_overrides(&self, config: &mut UnitflowConfig) {
        // Defaults
        if let Ok(val) = env::var("UNITFLOW_DEFAULT_LIMIT") {
            config.defaults.limit = val;
        }
        if let Ok(val) = env::var("UNITFLOW_DEFAULT_ISOLATION") {
            config.defaults.isolation_level = if val.trim().is_empty() { None } else { Some(val) };
        }
        if let Ok(val) = env::var("UNITFLOW_DEFAULT_TIMEOUT_MS") {
            if let Ok(ms) = val.parse() {
                config.defaults.timeout_ms = Some(ms);
            }
        }

        // Pipeline
        if let Ok(val) = env::var("UNITFLOW_SOFT_DELETE_TYPES") {
            config.pipeline.soft_delete_entity_types = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        // Logging
        if let Ok(val) = env::var("UNITFLOW_LOG_FORMAT") {
            config.logging.format = LogFormat::from_str_lossy(&val);
        }
        if let Ok(val) = env::var("UNITFLOW_LOG_LEVEL") {
            config.logging.level = val;
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
