//! Unitflow Common Types
//!
//! Value types shared by the configuration layer and the unit-of-work engine:
//! - `Limit` - how a scope request relates to an existing ambient scope
//! - `IsolationLevel` - isolation hint handed to enlisted features
//! - `UnitOfWorkOptions` - frozen per-scope options
//! - `TsidGenerator` - time-sorted ids for scopes and events

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod tsid;

pub use tsid::TsidGenerator;

// ============================================================================
// Option Errors
// ============================================================================

/// Rejected or contradictory scope options.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    #[error("Unknown scope limit: {0}")]
    UnknownLimit(String),

    #[error("Unknown isolation level: {0}")]
    UnknownIsolationLevel(String),

    #[error("Contradictory options: {0}")]
    Contradictory(String),
}

// ============================================================================
// Scope Limit
// ============================================================================

/// Propagation policy for a new scope request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Limit {
    /// Join the active ambient scope, or create one if there is none.
    #[default]
    Required,
    /// Always create a fresh scope, suspending the ambient one.
    RequiresNew,
    /// Run outside any transactional boundary.
    Suppress,
}

impl Limit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Limit::Required => "required",
            Limit::RequiresNew => "requires_new",
            Limit::Suppress => "suppress",
        }
    }

    /// Parse from string, accepting snake, kebab, and Pascal spellings
    pub fn parse(s: &str) -> Result<Self, OptionsError> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "required" => Ok(Limit::Required),
            "requiresnew" => Ok(Limit::RequiresNew),
            "suppress" => Ok(Limit::Suppress),
            _ => Err(OptionsError::UnknownLimit(s.to_string())),
        }
    }
}

impl std::fmt::Display for Limit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Isolation Level
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
            IsolationLevel::RepeatableRead => "repeatable_read",
            IsolationLevel::Snapshot => "snapshot",
            IsolationLevel::Serializable => "serializable",
        }
    }

    pub fn parse(s: &str) -> Result<Self, OptionsError> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| *c != '_' && *c != '-' && *c != ' ')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "readuncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "readcommitted" => Ok(IsolationLevel::ReadCommitted),
            "repeatableread" => Ok(IsolationLevel::RepeatableRead),
            "snapshot" => Ok(IsolationLevel::Snapshot),
            "serializable" => Ok(IsolationLevel::Serializable),
            _ => Err(OptionsError::UnknownIsolationLevel(s.to_string())),
        }
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Unit of Work Options
// ============================================================================

/// Options a scope is created with. Frozen once the scope exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnitOfWorkOptions {
    pub limit: Limit,
    pub isolation_level: Option<IsolationLevel>,
    pub timeout: Option<Duration>,
}

impl UnitOfWorkOptions {
    pub fn new(limit: Limit) -> Self {
        Self {
            limit,
            isolation_level: None,
            timeout: None,
        }
    }

    pub fn required() -> Self {
        Self::new(Limit::Required)
    }

    pub fn requires_new() -> Self {
        Self::new(Limit::RequiresNew)
    }

    pub fn suppress() -> Self {
        Self::new(Limit::Suppress)
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fill unset fields from `defaults`. The limit always comes from `self`.
    pub fn or_defaults(mut self, defaults: &UnitOfWorkOptions) -> Self {
        if self.limit != Limit::Suppress {
            if self.isolation_level.is_none() {
                self.isolation_level = defaults.isolation_level;
            }
            if self.timeout.is_none() {
                self.timeout = defaults.timeout;
            }
        }
        self
    }

    /// Reject combinations that cannot describe a real scope.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.limit == Limit::Suppress {
            if self.isolation_level.is_some() {
                return Err(OptionsError::Contradictory(
                    "a suppressed scope cannot carry an isolation level".to_string(),
                ));
            }
            if self.timeout.is_some() {
                return Err(OptionsError::Contradictory(
                    "a suppressed scope cannot carry a timeout".to_string(),
                ));
            }
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(OptionsError::Contradictory(
                "timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
