//! Unit of Work Errors
//!
//! Every failure the engine reports to callers of `create`, `save_changes`,
//! and `dispose`. Collaborator failures (features, hooks, dispatchers) arrive
//! as `anyhow::Error` and are wrapped with the feature key or hook name.

use std::time::Duration;
use thiserror::Error;

use crate::unit_of_work::UowState;

#[derive(Error, Debug)]
pub enum UowError {
    /// Operation attempted on a scope that is not `Active`.
    #[error("Invalid scope state: {scope} is {state}, cannot {operation}")]
    InvalidScopeState {
        scope: String,
        state: UowState,
        operation: &'static str,
    },

    #[error("Invalid options: {message}")]
    InvalidOptions { message: String },

    #[error("Feature '{key}' failed to enlist: {source}")]
    FeatureEnlistmentFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Feature '{key}' failed to save changes: {source}")]
    FeatureSaveFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Feature '{key}' failed to commit: {source}")]
    FeatureCommitFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Feature '{key}' failed to roll back: {source}")]
    FeatureRollbackFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Feature '{key}' failed to dispose: {source}")]
    FeatureDisposeFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    /// Feature key already enlisted by another live scope in the same flow.
    #[error("Feature '{key}' is already enlisted by active scope {owner}")]
    FeatureKeyConflict { key: String, owner: String },

    /// A pre-save hook rejected an entity. Always fatal to the save.
    #[error("Pre-save hook '{hook}' failed for {entity}: {source}")]
    HookFailed {
        hook: String,
        entity: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Ambient order violation on {scope}: {reason}")]
    AmbientOrderViolation { scope: String, reason: String },

    #[error("Save cancelled before commit")]
    Cancelled,

    #[error("Scope timed out after {timeout:?} before commit")]
    TimedOut { timeout: Duration },

    /// Some features committed before the save stopped. The scope is not
    /// atomic across them and no clean rollback is claimed.
    #[error("Partial completion: committed {committed:?}, not committed {not_committed:?}: {cause}")]
    PartialCompletion {
        committed: Vec<String>,
        not_committed: Vec<String>,
        #[source]
        cause: Box<UowError>,
    },

    /// The primary failure plus every rollback that failed while cleaning up.
    #[error("{primary}; rollback also failed: {}", join_errors(rollback_failures))]
    Aggregate {
        primary: Box<UowError>,
        rollback_failures: Vec<UowError>,
    },

    #[error("No ambient flow: scopes must be created inside UnitOfWorkManager::flow")]
    NoAmbientFlow,

    /// The caller's operation failed inside `UnitOfWorkManager::execute`.
    #[error("Operation failed: {0}")]
    Operation(#[source] anyhow::Error),
}

fn join_errors(errors: &[UowError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl UowError {
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            message: message.into(),
        }
    }

    pub fn order_violation(scope: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::AmbientOrderViolation {
            scope: scope.into(),
            reason: reason.into(),
        }
    }

    /// Attach rollback failures to a primary error. Returns the primary
    /// unchanged when every rollback succeeded.
    pub(crate) fn with_rollback_failures(primary: UowError, failures: Vec<UowError>) -> Self {
        if failures.is_empty() {
            primary
        } else {
            Self::Aggregate {
                primary: Box::new(primary),
                rollback_failures: failures,
            }
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidScopeState { .. } => "INVALID_SCOPE_STATE",
            Self::InvalidOptions { .. } => "INVALID_OPTIONS",
            Self::FeatureEnlistmentFailed { .. } => "FEATURE_ENLISTMENT_FAILED",
            Self::FeatureSaveFailed { .. } => "FEATURE_SAVE_FAILED",
            Self::FeatureCommitFailed { .. } => "FEATURE_COMMIT_FAILED",
            Self::FeatureRollbackFailed { .. } => "FEATURE_ROLLBACK_FAILED",
            Self::FeatureDisposeFailed { .. } => "FEATURE_DISPOSE_FAILED",
            Self::FeatureKeyConflict { .. } => "FEATURE_KEY_CONFLICT",
            Self::HookFailed { .. } => "HOOK_FAILED",
            Self::AmbientOrderViolation { .. } => "AMBIENT_ORDER_VIOLATION",
            Self::Cancelled => "CANCELLED",
            Self::TimedOut { .. } => "TIMED_OUT",
            Self::PartialCompletion { .. } => "PARTIAL_COMPLETION",
            Self::Aggregate { .. } => "AGGREGATE",
            Self::NoAmbientFlow => "NO_AMBIENT_FLOW",
            Self::Operation(_) => "OPERATION_FAILED",
        }
    }

    /// True when at least one feature committed before the failure
    pub fn is_partial(&self) -> bool {
        match self {
            Self::PartialCompletion { .. } => true,
            Self::Aggregate { primary, .. } => primary.is_partial(),
            _ => false,
        }
    }

    /// The error that started the failure, looking through aggregation
    pub fn primary(&self) -> &UowError {
        match self {
            Self::Aggregate { primary, .. } => primary.primary(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, UowError>;
