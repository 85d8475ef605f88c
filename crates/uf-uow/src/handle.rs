//! Scoped handles returned by the manager.
//!
//! A handle is what the caller owns: the root handle of a physical scope
//! drives its save and teardown, joined handles only participate, and
//! suppressed handles do nothing. Handles are not `Clone`; dropping one
//! without `dispose` cleans the stack up and rolls back in the background.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::ambient::{AmbientFlow, HandleId};
use crate::entity::TrackedEntity;
use crate::error::{Result, UowError};
use crate::feature::TransactionFeature;
use crate::unit_of_work::{UnitOfWork, UowState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    /// Created the physical scope and owns its commit
    Root,
    /// Joined an ambient scope; completion is a vote, not a commit
    Joined,
    /// No scope at all
    Suppressed,
}

pub struct UnitOfWorkHandle {
    kind: HandleKind,
    id: HandleId,
    scope: Option<UnitOfWork>,
    flow: Arc<AmbientFlow>,
    completed: bool,
    disposed: bool,
}

impl UnitOfWorkHandle {
    pub(crate) fn root(id: HandleId, scope: UnitOfWork, flow: Arc<AmbientFlow>) -> Self {
        Self::build(HandleKind::Root, id, Some(scope), flow)
    }

    pub(crate) fn joined(id: HandleId, scope: UnitOfWork, flow: Arc<AmbientFlow>) -> Self {
        Self::build(HandleKind::Joined, id, Some(scope), flow)
    }

    pub(crate) fn suppressed(id: HandleId, flow: Arc<AmbientFlow>) -> Self {
        Self::build(HandleKind::Suppressed, id, None, flow)
    }

    fn build(
        kind: HandleKind,
        id: HandleId,
        scope: Option<UnitOfWork>,
        flow: Arc<AmbientFlow>,
    ) -> Self {
        Self {
            kind,
            id,
            scope,
            flow,
            completed: false,
            disposed: false,
        }
    }

    pub fn kind(&self) -> HandleKind {
        self.kind
    }

    /// The physical scope, `None` when suppressed
    pub fn unit_of_work(&self) -> Option<&UnitOfWork> {
        self.scope.as_ref()
    }

    pub fn state(&self) -> Option<UowState> {
        self.scope.as_ref().map(UnitOfWork::state)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    fn ensure_live(&self, operation: &'static str) -> Result<()> {
        if !self.disposed {
            return Ok(());
        }
        Err(UowError::InvalidScopeState {
            scope: self
                .scope
                .as_ref()
                .map_or_else(|| "suppressed scope".to_string(), |s| s.id().to_string()),
            state: UowState::Disposed,
            operation,
        })
    }

    pub async fn enlist(
        &self,
        key: impl Into<String>,
        feature: Arc<dyn TransactionFeature>,
    ) -> Result<()> {
        self.ensure_live("enlist")?;
        match &self.scope {
            Some(scope) => scope.enlist(key, feature).await,
            None => Ok(()),
        }
    }

    pub fn track(
        &self,
        key: impl Into<String>,
        feature: Arc<dyn TransactionFeature>,
        entity: TrackedEntity,
    ) -> Result<()> {
        self.ensure_live("track changes")?;
        match &self.scope {
            Some(scope) => scope.track(key, feature, entity),
            None => Ok(()),
        }
    }

    /// Complete this handle. Only the root handle saves; a joined handle
    /// records that it is done and leaves the commit to the root.
    pub async fn save_changes(&mut self, cancel: &CancellationToken) -> Result<()> {
        self.ensure_live("save changes")?;
        let Some(scope) = self.scope.clone() else {
            return Ok(());
        };

        match self.kind {
            HandleKind::Suppressed => Ok(()),
            HandleKind::Joined => {
                let state = scope.state();
                if state != UowState::Active {
                    return Err(UowError::InvalidScopeState {
                        scope: scope.id().to_string(),
                        state,
                        operation: "save changes",
                    });
                }
                self.completed = true;
                debug!(scope_id = %scope.id(), "Joined handle completed");
                Ok(())
            }
            HandleKind::Root => {
                let joins = self.flow.stack().joins_on(self.id);
                if joins > 0 {
                    let err = UowError::order_violation(
                        scope.id().as_str(),
                        format!("saved while {joins} joined handle(s) are still live"),
                    );
                    error!(scope_id = %scope.id(), error = %err, "Ambient order violation");
                    return Err(err);
                }
                let result = scope.complete(cancel).await;
                self.completed = true;
                result
            }
        }
    }

    /// Release the handle. Idempotent. On `AmbientOrderViolation` nothing is
    /// released and the handle stays live.
    pub async fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }

        match (self.kind, self.scope.clone()) {
            (HandleKind::Root, Some(scope)) => {
                self.flow
                    .stack()
                    .pop_root(self.id, scope.id())
                    .inspect_err(|e| error!(scope_id = %scope.id(), error = %e, "Ambient order violation"))?;
                self.disposed = true;

                let mut failures = Vec::new();
                if matches!(scope.state(), UowState::Active | UowState::Completing) {
                    warn!(scope_id = %scope.id(), "Unit of work disposed without saving, rolling back");
                    failures.extend(scope.rollback_enlisted().await);
                }
                failures.extend(scope.dispose_features().await);

                debug!(
                    scope_id = %scope.id(),
                    resumed = ?self.flow.current_scope().map(|s| s.id().clone()),
                    "Unit of work disposed"
                );
                collect_failures(failures)
            }
            (HandleKind::Joined, Some(scope)) => {
                self.flow
                    .stack()
                    .release_join(self.id, scope.id())
                    .inspect_err(|e| error!(scope_id = %scope.id(), error = %e, "Ambient order violation"))?;
                self.disposed = true;

                if !self.completed && scope.is_active() {
                    warn!(
                        scope_id = %scope.id(),
                        "Joined handle disposed without completion, rolling back shared scope"
                    );
                    return collect_failures(scope.rollback_enlisted().await);
                }
                debug!(scope_id = %scope.id(), "Joined handle released");
                Ok(())
            }
            _ => {
                self.flow
                    .stack()
                    .release_suppression(self.id)
                    .inspect_err(|e| error!(error = %e, "Ambient order violation"))?;
                self.disposed = true;
                debug!("Suppression released");
                Ok(())
            }
        }
    }
}

fn collect_failures(mut failures: Vec<UowError>) -> Result<()> {
    if failures.is_empty() {
        return Ok(());
    }
    let primary = failures.remove(0);
    Err(UowError::with_rollback_failures(primary, failures))
}

impl Drop for UnitOfWorkHandle {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        self.flow.stack().force_remove(self.id);

        match (self.kind, &self.scope) {
            (HandleKind::Root, Some(scope)) => {
                warn!(scope_id = %scope.id(), state = %scope.state(), "Unit of work handle dropped without dispose");
                scope.abandon(true);
            }
            (HandleKind::Joined, Some(scope)) if !self.completed && scope.is_active() => {
                warn!(scope_id = %scope.id(), "Joined handle dropped without completion, rolling back shared scope");
                scope.abandon(false);
            }
            _ => {}
        }
    }
}

impl std::fmt::Debug for UnitOfWorkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkHandle")
            .field("kind", &self.kind)
            .field("scope", &self.scope.as_ref().map(|s| s.id().clone()))
            .field("completed", &self.completed)
            .field("disposed", &self.disposed)
            .finish()
    }
}
