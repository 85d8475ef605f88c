//! Unitflow Configuration System
//!
//! TOML-based configuration with environment variable overrides. Supplies the
//! default scope options, the per-operation policy table, and the settings of
//! the built-in lifetime hooks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use uf_common::logging::LogFormat;
use uf_common::{IsolationLevel, Limit, OptionsError, UnitOfWorkOptions};

mod loader;

pub use loader::ConfigLoader;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid options for {context}: {source}")]
    InvalidOptions {
        context: String,
        #[source]
        source: OptionsError,
    },

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

impl ConfigError {
    fn invalid(context: impl Into<String>, source: OptionsError) -> Self {
        Self::InvalidOptions {
            context: context.into(),
            source,
        }
    }
}

/// Root configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UnitflowConfig {
    pub defaults: ScopeDefaultsConfig,
    pub operations: BTreeMap<String, OperationConfig>,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// Default options applied to every scope request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeDefaultsConfig {
    pub limit: String,
    pub isolation_level: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl Default for ScopeDefaultsConfig {
    fn default() -> Self {
        Self {
            limit: Limit::Required.as_str().to_string(),
            isolation_level: None,
            timeout_ms: None,
        }
    }
}

impl ScopeDefaultsConfig {
    pub fn to_options(&self) -> Result<UnitOfWorkOptions, ConfigError> {
        let options = build_options(
            &self.limit,
            self.isolation_level.as_deref(),
            self.timeout_ms,
        )
        .map_err(|e| ConfigError::invalid("defaults", e))?;
        options
            .validate()
            .map_err(|e| ConfigError::invalid("defaults", e))?;
        Ok(options)
    }
}

/// Per-operation override. Unset fields fall back to the defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OperationConfig {
    pub limit: Option<String>,
    pub isolation_level: Option<String>,
    pub timeout_ms: Option<u64>,
    /// Run the operation without a unit of work
    pub disabled: bool,
}

impl OperationConfig {
    /// Resolve against the defaults. `disabled` always yields `Suppress`.
    pub fn to_options(
        &self,
        operation_id: &str,
        defaults: &UnitOfWorkOptions,
    ) -> Result<UnitOfWorkOptions, ConfigError> {
        let context = format!("operation '{}'", operation_id);

        if self.disabled {
            if self.limit.is_some() || self.isolation_level.is_some() || self.timeout_ms.is_some() {
                return Err(ConfigError::invalid(
                    context,
                    OptionsError::Contradictory(
                        "a disabled operation cannot set limit, isolation_level, or timeout_ms"
                            .to_string(),
                    ),
                ));
            }
            return Ok(UnitOfWorkOptions::suppress());
        }

        let limit = match &self.limit {
            Some(raw) => Limit::parse(raw).map_err(|e| ConfigError::invalid(context.clone(), e))?,
            None => defaults.limit,
        };
        let mut options = UnitOfWorkOptions::new(limit);
        if let Some(raw) = &self.isolation_level {
            options.isolation_level = Some(
                IsolationLevel::parse(raw).map_err(|e| ConfigError::invalid(context.clone(), e))?,
            );
        }
        if let Some(ms) = self.timeout_ms {
            options.timeout = Some(Duration::from_millis(ms));
        }

        options
            .validate()
            .map_err(|e| ConfigError::invalid(context.clone(), e))?;
        let options = options.or_defaults(defaults);
        options
            .validate()
            .map_err(|e| ConfigError::invalid(context, e))?;
        Ok(options)
    }
}

/// Built-in lifetime hook settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub audit_enabled: bool,
    pub audit_order: i32,
    pub soft_delete_enabled: bool,
    pub soft_delete_order: i32,
    /// Entity types whose deletes are rewritten into soft deletes
    pub soft_delete_entity_types: Vec<String>,
    pub domain_events_enabled: bool,
    pub domain_events_order: i32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            audit_enabled: true,
            audit_order: -1000,
            soft_delete_enabled: true,
            soft_delete_order: -500,
            soft_delete_entity_types: Vec::new(),
            domain_events_enabled: true,
            domain_events_order: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            level: "info".to_string(),
        }
    }
}

fn build_options(
    limit: &str,
    isolation_level: Option<&str>,
    timeout_ms: Option<u64>,
) -> Result<UnitOfWorkOptions, OptionsError> {
    let mut options = UnitOfWorkOptions::new(Limit::parse(limit)?);
    if let Some(raw) = isolation_level {
        options.isolation_level = Some(IsolationLevel::parse(raw)?);
    }
    options.timeout = timeout_ms.map(Duration::from_millis);
    Ok(options)
}

impl UnitflowConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: UnitflowConfig = toml::from_str(content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }

    /// Resolved default scope options
    pub fn default_options(&self) -> Result<UnitOfWorkOptions, ConfigError> {
        self.defaults.to_options()
    }

    /// Resolve every operation entry against the defaults
    pub fn operation_options(&self) -> Result<BTreeMap<String, UnitOfWorkOptions>, ConfigError> {
        let defaults = self.default_options()?;
        self.operations
            .iter()
            .map(|(id, op)| Ok((id.clone(), op.to_options(id, &defaults)?)))
            .collect()
    }

    /// Check every option set, failing on the first invalid one
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.operation_options()?;
        if self.operations.keys().any(|id| id.trim().is_empty()) {
            return Err(ConfigError::ValidationError(
                "operation ids must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Unitflow Configuration
# Environment variables override these settings

[defaults]
limit = "required"              # required, requires_new, suppress
isolation_level = "read_committed"
timeout_ms = 30000

[operations."orders.place"]
limit = "requires_new"
isolation_level = "serializable"

[operations."reports.render"]
disabled = true

[pipeline]
audit_enabled = true
audit_order = -1000
soft_delete_enabled = true
soft_delete_order = -500
soft_delete_entity_types = ["Customer", "Order"]
domain_events_enabled = true
domain_events_order = 0

[logging]
format = "text"                 # text, json
level = "info"
"#
        .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_toml_parses() {
        let config = UnitflowConfig::from_toml_str(&UnitflowConfig::example_toml()).unwrap();
        config.validate().unwrap();

        let defaults = config.default_options().unwrap();
        assert_eq!(defaults.limit, Limit::Required);
        assert_eq!(defaults.isolation_level, Some(IsolationLevel::ReadCommitted));
        assert_eq!(defaults.timeout, Some(Duration::from_secs(30)));

        let ops = config.operation_options().unwrap();
        let place = ops.get("orders.place").unwrap();
        assert_eq!(place.limit, Limit::RequiresNew);
        assert_eq!(place.isolation_level, Some(IsolationLevel::Serializable));
        assert_eq!(place.timeout, Some(Duration::from_secs(30)));

        let render = ops.get("reports.render").unwrap();
        assert_eq!(*render, UnitOfWorkOptions::suppress());

        assert_eq!(config.pipeline.soft_delete_entity_types, vec!["Customer", "Order"]);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = UnitflowConfig::from_toml_str("").unwrap();
        let defaults = config.default_options().unwrap();
        assert_eq!(defaults, UnitOfWorkOptions::required());
        assert_eq!(config.pipeline.audit_order, -1000);
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_unknown_limit_is_invalid_options() {
        let config = UnitflowConfig::from_toml_str(
            r#"
[defaults]
limit = "mandatory"
"#,
        )
        .unwrap();
        let err = config.default_options().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidOptions { source: OptionsError::UnknownLimit(_), .. }
        ));
    }

    #[test]
    fn test_disabled_operation_with_limit_is_contradictory() {
        let config = UnitflowConfig::from_toml_str(
            r#"
[operations."audit.purge"]
disabled = true
limit = "requires_new"
"#,
        )
        .unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidOptions { source: OptionsError::Contradictory(_), .. }
        ));
        assert!(err.to_string().contains("audit.purge"));
    }

    #[test]
    fn test_suppress_operation_does_not_inherit_timeout() {
        let config = UnitflowConfig::from_toml_str(
            r#"
[defaults]
timeout_ms = 5000

[operations."cache.warm"]
limit = "suppress"
"#,
        )
        .unwrap();
        let ops = config.operation_options().unwrap();
        assert_eq!(ops["cache.warm"], UnitOfWorkOptions::suppress());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let config = UnitflowConfig::from_toml_str(
            r#"
[defaults]
timeout_ms = 0
"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
