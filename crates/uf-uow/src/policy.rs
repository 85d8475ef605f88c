//! Operation policy table
//!
//! Static map from operation id to the scope options that operation runs
//! with. Built once at startup, from code or from `[operations]` in the
//! configuration file, and validated as a whole before use.

use std::collections::HashMap;

use uf_common::UnitOfWorkOptions;
use uf_config::{ConfigError, UnitflowConfig};

use crate::error::{Result, UowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPolicy {
    Options(UnitOfWorkOptions),
    /// The operation runs without a unit of work
    Disabled,
}

impl OperationPolicy {
    pub fn options(&self) -> UnitOfWorkOptions {
        match self {
            OperationPolicy::Options(options) => *options,
            OperationPolicy::Disabled => UnitOfWorkOptions::suppress(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PolicyTable {
    defaults: UnitOfWorkOptions,
    entries: HashMap<String, OperationPolicy>,
}

impl PolicyTable {
    pub fn builder(defaults: UnitOfWorkOptions) -> PolicyTableBuilder {
        PolicyTableBuilder {
            defaults,
            entries: Vec::new(),
        }
    }

    pub fn from_config(config: &UnitflowConfig) -> std::result::Result<Self, ConfigError> {
        let defaults = config.default_options()?;
        let mut entries = HashMap::with_capacity(config.operations.len());
        for (id, op) in &config.operations {
            let options = op.to_options(id, &defaults)?;
            let policy = if op.disabled {
                OperationPolicy::Disabled
            } else {
                OperationPolicy::Options(options)
            };
            entries.insert(id.clone(), policy);
        }
        Ok(Self { defaults, entries })
    }

    pub fn defaults(&self) -> &UnitOfWorkOptions {
        &self.defaults
    }

    pub fn policy(&self, operation_id: &str) -> Option<&OperationPolicy> {
        self.entries.get(operation_id)
    }

    /// Options for `operation_id`; unknown ids get the defaults
    pub fn resolve(&self, operation_id: &str) -> UnitOfWorkOptions {
        self.entries
            .get(operation_id)
            .map_or(self.defaults, OperationPolicy::options)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub struct PolicyTableBuilder {
    defaults: UnitOfWorkOptions,
    entries: Vec<(String, OperationPolicy)>,
}

impl PolicyTableBuilder {
    pub fn operation(mut self, operation_id: impl Into<String>, options: UnitOfWorkOptions) -> Self {
        self.entries
            .push((operation_id.into(), OperationPolicy::Options(options)));
        self
    }

    pub fn disable(mut self, operation_id: impl Into<String>) -> Self {
        self.entries
            .push((operation_id.into(), OperationPolicy::Disabled));
        self
    }

    /// Validate every entry, resolved against the defaults
    pub fn build(self) -> Result<PolicyTable> {
        self.defaults
            .validate()
            .map_err(|e| UowError::invalid_options(format!("defaults: {e}")))?;

        let mut entries = HashMap::with_capacity(self.entries.len());
        for (id, policy) in self.entries {
            let policy = match policy {
                OperationPolicy::Options(options) => {
                    let resolved = options.or_defaults(&self.defaults);
                    resolved
                        .validate()
                        .map_err(|e| UowError::invalid_options(format!("operation '{id}': {e}")))?;
                    OperationPolicy::Options(resolved)
                }
                OperationPolicy::Disabled => OperationPolicy::Disabled,
            };
            if entries.insert(id.clone(), policy).is_some() {
                return Err(UowError::invalid_options(format!(
                    "operation '{id}' is configured twice"
                )));
            }
        }

        Ok(PolicyTable {
            defaults: self.defaults,
            entries,
        })
    }
}
