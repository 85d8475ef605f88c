//! Transaction Features
//!
//! A transaction feature is anything that can take part in a unit of work:
//! an ORM session, a raw connection, an outbox writer. The engine only
//! orchestrates; the feature owns the actual transaction.

use async_trait::async_trait;
use std::sync::Arc;

use uf_common::UnitOfWorkOptions;

use crate::entity::TrackedEntity;
use crate::error::{Result, UowError};
use crate::unit_of_work::UowState;

/// Contract implemented by transactional resources.
///
/// The engine calls `enlist` at most once per scope and key, then exactly one
/// of `commit` or `rollback`, then `dispose`. Implementations do not need to
/// guard against repeated calls themselves.
#[async_trait]
pub trait TransactionFeature: Send + Sync {
    /// Begin or attach to a transaction using the scope's options.
    async fn enlist(&self, options: &UnitOfWorkOptions) -> anyhow::Result<()>;

    /// Write this feature's portion of the change set inside the transaction.
    async fn save_changes(&self, _changes: &[TrackedEntity]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn commit(&self) -> anyhow::Result<()>;

    async fn rollback(&self) -> anyhow::Result<()>;

    /// Release the underlying resource.
    async fn dispose(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureState {
    /// Known to the scope, transaction not started yet
    Registered,
    Enlisted,
    Committed,
    /// Commit was attempted and failed; rollback is no longer allowed
    CommitFailed,
    RolledBack,
    Disposed,
}

impl FeatureState {
    fn as_scope_state(&self) -> UowState {
        match self {
            FeatureState::Registered | FeatureState::Enlisted => UowState::Active,
            FeatureState::Committed | FeatureState::CommitFailed => UowState::Committed,
            FeatureState::RolledBack => UowState::RolledBack,
            FeatureState::Disposed => UowState::Disposed,
        }
    }
}

/// A feature registered with one scope, plus its lifecycle state.
///
/// Transitions are decided under the scope lock; the async call to the
/// feature happens after the lock is released.
pub(crate) struct FeatureSlot {
    key: String,
    feature: Arc<dyn TransactionFeature>,
    state: FeatureState,
}

impl FeatureSlot {
    pub(crate) fn new(key: impl Into<String>, feature: Arc<dyn TransactionFeature>) -> Self {
        Self {
            key: key.into(),
            feature,
            state: FeatureState::Registered,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn feature(&self) -> Arc<dyn TransactionFeature> {
        self.feature.clone()
    }

    pub(crate) fn state(&self) -> FeatureState {
        self.state
    }

    pub(crate) fn is_enlisted(&self) -> bool {
        self.state == FeatureState::Enlisted
    }

    fn invalid(&self, operation: &'static str) -> UowError {
        UowError::InvalidScopeState {
            scope: format!("feature '{}'", self.key),
            state: self.state.as_scope_state(),
            operation,
        }
    }

    /// Returns `true` when the caller must invoke `enlist` on the feature.
    pub(crate) fn begin_enlist(&mut self) -> Result<bool> {
        match self.state {
            FeatureState::Registered => {
                self.state = FeatureState::Enlisted;
                Ok(true)
            }
            FeatureState::Enlisted => Ok(false),
            _ => Err(self.invalid("enlist")),
        }
    }

    /// Undo `begin_enlist` after the feature refused to enlist.
    pub(crate) fn enlist_failed(&mut self) {
        if self.state == FeatureState::Enlisted {
            self.state = FeatureState::Registered;
        }
    }

    pub(crate) fn begin_commit(&mut self) -> Result<()> {
        match self.state {
            FeatureState::Enlisted => {
                self.state = FeatureState::Committed;
                Ok(())
            }
            _ => Err(self.invalid("commit")),
        }
    }

    pub(crate) fn commit_failed(&mut self) {
        if self.state == FeatureState::Committed {
            self.state = FeatureState::CommitFailed;
        }
    }

    /// Returns `true` when the caller must invoke `rollback`. A feature that
    /// never enlisted has nothing to roll back.
    pub(crate) fn begin_rollback(&mut self) -> Result<bool> {
        match self.state {
            FeatureState::Enlisted => {
                self.state = FeatureState::RolledBack;
                Ok(true)
            }
            FeatureState::Registered => Ok(false),
            _ => Err(self.invalid("roll back")),
        }
    }

    /// Returns `true` when the caller must invoke `dispose`.
    pub(crate) fn begin_dispose(&mut self) -> bool {
        if self.state == FeatureState::Disposed {
            false
        } else {
            self.state = FeatureState::Disposed;
            true
        }
    }
}
