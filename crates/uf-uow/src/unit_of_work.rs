//! Unit of Work
//!
//! One physical transactional boundary: identity, frozen options, a registry
//! of features keyed by string, and the pending change set. `UnitOfWork` is a
//! cheap-clone reference; lifecycle (save, dispose) is driven through the
//! `UnitOfWorkHandle` the manager hands out.
//!
//! State machine:
//!
//! ```text
//! Active ──save──> Completing ──ok──> Committed ──dispose──> Disposed
//!   │                  ├──fail──> RolledBack ──dispose──> Disposed
//!   │                  └──fail after a commit──> PartiallyCommitted ──dispose──> Disposed
//!   └──dispose without save──> RolledBack ──> Disposed
//! ```

use chrono::Utc;
use futures::future::join_all;
use indexmap::IndexMap;
use parking_lot::{Mutex, MutexGuard};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use uf_common::{TsidGenerator, UnitOfWorkOptions};

use crate::ambient::AmbientFlow;
use crate::context::ExecutionContext;
use crate::entity::TrackedEntity;
use crate::error::{Result, UowError};
use crate::feature::{FeatureSlot, FeatureState, TransactionFeature};
use crate::pipeline::{LifetimePipeline, SaveContext};

/// Opaque scope identity, e.g. `uow-0HZXEQ5Y8JY5Z`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(String);

impl ScopeId {
    pub(crate) fn generate() -> Self {
        Self(TsidGenerator::prefixed("uow"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UowState {
    Active,
    Completing,
    Committed,
    /// Some features committed before the save stopped; the rest rolled back
    PartiallyCommitted,
    RolledBack,
    Disposed,
}

impl std::fmt::Display for UowState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UowState::Active => write!(f, "Active"),
            UowState::Completing => write!(f, "Completing"),
            UowState::Committed => write!(f, "Committed"),
            UowState::PartiallyCommitted => write!(f, "PartiallyCommitted"),
            UowState::RolledBack => write!(f, "RolledBack"),
            UowState::Disposed => write!(f, "Disposed"),
        }
    }
}

struct PendingChange {
    feature_key: String,
    entity: TrackedEntity,
}

struct Core {
    state: UowState,
    features: IndexMap<String, FeatureSlot>,
    changes: Vec<PendingChange>,
}

struct Inner {
    id: ScopeId,
    options: UnitOfWorkOptions,
    parent: Option<Weak<Inner>>,
    flow: Weak<AmbientFlow>,
    pipeline: Arc<LifetimePipeline>,
    execution: ExecutionContext,
    created_at: Instant,
    core: Mutex<Core>,
}

/// Shared reference to one physical unit of work.
#[derive(Clone)]
pub struct UnitOfWork {
    inner: Arc<Inner>,
}

type FeatureRef = (String, Arc<dyn TransactionFeature>);

impl UnitOfWork {
    pub(crate) fn new(
        options: UnitOfWorkOptions,
        parent: Option<&UnitOfWork>,
        flow: &Arc<AmbientFlow>,
        pipeline: Arc<LifetimePipeline>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: ScopeId::generate(),
                options,
                parent: parent.map(|p| Arc::downgrade(&p.inner)),
                flow: Arc::downgrade(flow),
                pipeline,
                execution: flow.execution_context().clone(),
                created_at: Instant::now(),
                core: Mutex::new(Core {
                    state: UowState::Active,
                    features: IndexMap::new(),
                    changes: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> &ScopeId {
        &self.inner.id
    }

    pub fn options(&self) -> &UnitOfWorkOptions {
        &self.inner.options
    }

    pub fn state(&self) -> UowState {
        self.inner.core.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == UowState::Active
    }

    /// The ambient scope this one joined or suspended, while it is alive
    pub fn parent(&self) -> Option<UnitOfWork> {
        self.inner
            .parent
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| UnitOfWork { inner })
    }

    pub fn execution_context(&self) -> &ExecutionContext {
        &self.inner.execution
    }

    /// True when both references point at the same physical scope
    pub fn ptr_eq(&self, other: &UnitOfWork) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registered feature keys in registration order
    pub fn feature_keys(&self) -> Vec<String> {
        self.inner.core.lock().features.keys().cloned().collect()
    }

    pub fn feature_state(&self, key: &str) -> Option<FeatureState> {
        self.inner.core.lock().features.get(key).map(|s| s.state())
    }

    pub fn is_enlisted(&self, key: &str) -> bool {
        self.feature_state(key) == Some(FeatureState::Enlisted)
    }

    /// Number of tracked entities waiting for the next save
    pub fn pending_changes(&self) -> usize {
        self.inner.core.lock().changes.len()
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.inner.core.lock()
    }

    fn ensure_active(&self, core: &Core, operation: &'static str) -> Result<()> {
        if core.state == UowState::Active {
            Ok(())
        } else {
            Err(UowError::InvalidScopeState {
                scope: self.inner.id.to_string(),
                state: core.state,
                operation,
            })
        }
    }

    /// Holds a feature key that another live scope in this flow uses
    pub(crate) fn holds_key(&self, key: &str) -> bool {
        let core = self.lock();
        if !matches!(core.state, UowState::Active | UowState::Completing) {
            return false;
        }
        core.features.get(key).is_some_and(|slot| {
            matches!(slot.state(), FeatureState::Registered | FeatureState::Enlisted)
        })
    }

    fn check_key_conflict(&self, key: &str) -> Result<()> {
        let Some(flow) = self.inner.flow.upgrade() else {
            return Ok(());
        };
        match flow.key_owner(key, &self.inner.id) {
            Some(owner) => Err(UowError::FeatureKeyConflict {
                key: key.to_string(),
                owner: owner.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Enlist a feature under `key`. A key that is already enlisted is a
    /// no-op; the first feature registered under a key wins.
    pub async fn enlist(
        &self,
        key: impl Into<String>,
        feature: Arc<dyn TransactionFeature>,
    ) -> Result<()> {
        let key = key.into();
        self.check_key_conflict(&key)?;
        {
            let mut core = self.lock();
            self.ensure_active(&core, "enlist")?;
            core.features
                .entry(key.clone())
                .or_insert_with(|| FeatureSlot::new(key.clone(), feature));
        }
        self.enlist_slot(&key).await
    }

    async fn enlist_slot(&self, key: &str) -> Result<()> {
        let feature = {
            let mut core = self.lock();
            let Some(slot) = core.features.get_mut(key) else {
                return Ok(());
            };
            if !slot.begin_enlist()? {
                debug!(scope_id = %self.inner.id, feature_key = key, "Feature already enlisted");
                return Ok(());
            }
            slot.feature()
        };

        if let Err(source) = feature.enlist(&self.inner.options).await {
            if let Some(slot) = self.lock().features.get_mut(key) {
                slot.enlist_failed();
            }
            return Err(UowError::FeatureEnlistmentFailed {
                key: key.to_string(),
                source,
            });
        }

        debug!(
            scope_id = %self.inner.id,
            feature_key = key,
            isolation = ?self.inner.options.isolation_level,
            "Feature enlisted"
        );
        Ok(())
    }

    /// Queue an entity change against the feature that will persist it. The
    /// feature is registered now and enlisted at save time.
    pub fn track(
        &self,
        key: impl Into<String>,
        feature: Arc<dyn TransactionFeature>,
        entity: TrackedEntity,
    ) -> Result<()> {
        let key = key.into();
        self.check_key_conflict(&key)?;

        let mut core = self.lock();
        self.ensure_active(&core, "track changes")?;
        core.features
            .entry(key.clone())
            .or_insert_with(|| FeatureSlot::new(key.clone(), feature));
        debug!(
            scope_id = %self.inner.id,
            feature_key = %key,
            entity = %entity.label(),
            state = %entity.state,
            "Change tracked"
        );
        core.changes.push(PendingChange {
            feature_key: key,
            entity,
        });
        Ok(())
    }

    fn deadline(&self) -> Option<Instant> {
        self.inner.options.timeout.map(|t| self.inner.created_at + t)
    }

    fn timed_out(&self) -> UowError {
        UowError::TimedOut {
            timeout: self.inner.options.timeout.unwrap_or_default(),
        }
    }

    fn check_abort(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(UowError::Cancelled);
        }
        if self.deadline().is_some_and(|d| Instant::now() >= d) {
            return Err(self.timed_out());
        }
        Ok(())
    }

    /// Run `fut` unless cancellation or the scope deadline fires first.
    async fn guard<T, F>(&self, cancel: &CancellationToken, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = self.deadline();
        let expired = async move {
            match deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UowError::Cancelled),
            _ = expired => Err(self.timed_out()),
            result = fut => result,
        }
    }

    fn save_context(&self) -> SaveContext {
        SaveContext {
            scope_id: self.inner.id.clone(),
            options: self.inner.options,
            execution: self.inner.execution.clone(),
            now: Utc::now(),
        }
    }

    /// Physical save: pre-save hooks, enlistment, persistence, commit,
    /// post-save hooks. Only the root handle of a scope calls this.
    pub(crate) async fn complete(&self, cancel: &CancellationToken) -> Result<()> {
        let mut changes = {
            let mut core = self.lock();
            self.ensure_active(&core, "save changes")?;
            core.state = UowState::Completing;
            std::mem::take(&mut core.changes)
        };
        changes.retain(|c| c.entity.is_pending());

        let ctx = self.save_context();
        debug!(scope_id = %self.inner.id, entities = changes.len(), "Saving changes");

        if let Err(primary) = self.guard(cancel, self.prepare(&mut changes, &ctx)).await {
            return Err(self.abort(primary).await);
        }

        let committed = self.commit_features(cancel).await?;

        let mut hook_failures = 0;
        for change in &changes {
            hook_failures += self.inner.pipeline.run_post_save(&change.entity, &ctx).await;
        }

        info!(
            scope_id = %self.inner.id,
            entities = changes.len(),
            features = committed,
            hook_failures,
            "Unit of work committed"
        );
        Ok(())
    }

    /// Steps 1-3: pre-save hooks, enlist referenced features, persist.
    async fn prepare(&self, changes: &mut Vec<PendingChange>, ctx: &SaveContext) -> Result<()> {
        for change in changes.iter_mut() {
            self.inner.pipeline.run_pre_save(&mut change.entity, ctx).await?;
        }
        changes.retain(|c| c.entity.is_pending());

        // One enlistment per feature key, in registration order
        let keys: Vec<String> = self
            .lock()
            .features
            .keys()
            .filter(|key| changes.iter().any(|c| &c.feature_key == *key))
            .cloned()
            .collect();

        for key in &keys {
            self.check_key_conflict(key)?;
            self.enlist_slot(key).await?;
        }

        for key in &keys {
            let batch: Vec<TrackedEntity> = changes
                .iter()
                .filter(|c| &c.feature_key == key)
                .map(|c| c.entity.clone())
                .collect();
            let feature = self.lock().features.get(key).map(|s| s.feature());
            if let Some(feature) = feature {
                feature
                    .save_changes(&batch)
                    .await
                    .map_err(|source| UowError::FeatureSaveFailed {
                        key: key.clone(),
                        source,
                    })?;
                debug!(scope_id = %self.inner.id, feature_key = %key, entities = batch.len(), "Changes persisted");
            }
        }
        Ok(())
    }

    /// Step 4: commit every enlisted feature in enlistment order. Returns the
    /// number of committed features.
    async fn commit_features(&self, cancel: &CancellationToken) -> Result<usize> {
        let targets: Vec<FeatureRef> = self
            .lock()
            .features
            .values()
            .filter(|s| s.is_enlisted())
            .map(|s| (s.key().to_string(), s.feature()))
            .collect();

        let mut committed: Vec<String> = Vec::new();
        for (key, feature) in &targets {
            if let Err(cause) = self.check_abort(cancel) {
                return Err(self.stop_commit(cause, committed, &targets).await);
            }

            if let Some(slot) = self.lock().features.get_mut(key) {
                slot.begin_commit()?;
            }

            match feature.commit().await {
                Ok(()) => {
                    debug!(scope_id = %self.inner.id, feature_key = %key, "Feature committed");
                    committed.push(key.clone());
                }
                Err(source) => {
                    if let Some(slot) = self.lock().features.get_mut(key) {
                        slot.commit_failed();
                    }
                    let cause = UowError::FeatureCommitFailed {
                        key: key.clone(),
                        source,
                    };
                    return Err(self.stop_commit(cause, committed, &targets).await);
                }
            }
        }

        self.lock().state = UowState::Committed;
        Ok(committed.len())
    }

    /// Roll back whatever has not committed yet. Once anything committed the
    /// outcome is reported as partial rather than as a clean rollback.
    async fn stop_commit(
        &self,
        cause: UowError,
        committed: Vec<String>,
        targets: &[FeatureRef],
    ) -> UowError {
        if committed.is_empty() {
            warn!(scope_id = %self.inner.id, error = %cause, "Commit aborted before any feature committed");
            let failures = self.rollback_enlisted().await;
            return UowError::with_rollback_failures(cause, failures);
        }

        let not_committed: Vec<String> = targets
            .iter()
            .map(|(key, _)| key.clone())
            .filter(|key| !committed.contains(key))
            .collect();
        error!(
            scope_id = %self.inner.id,
            committed = ?committed,
            not_committed = ?not_committed,
            error = %cause,
            "Unit of work partially committed"
        );
        // Committed features stay committed; only the rest roll back
        let failures = self.rollback_remaining(UowState::PartiallyCommitted).await;
        let primary = UowError::PartialCompletion {
            committed,
            not_committed,
            cause: Box::new(cause),
        };
        UowError::with_rollback_failures(primary, failures)
    }

    async fn abort(&self, primary: UowError) -> UowError {
        warn!(scope_id = %self.inner.id, error = %primary, "Save failed, rolling back");
        let failures = self.rollback_enlisted().await;
        UowError::with_rollback_failures(primary, failures)
    }

    /// Roll back every feature still enlisted, concurrently across keys, and
    /// move the scope to `RolledBack`. Returns the rollbacks that failed.
    pub(crate) async fn rollback_enlisted(&self) -> Vec<UowError> {
        self.rollback_remaining(UowState::RolledBack).await
    }

    /// Roll back every feature still enlisted and move the scope to `outcome`
    /// unless it is already disposed.
    async fn rollback_remaining(&self, outcome: UowState) -> Vec<UowError> {
        let targets: Vec<FeatureRef> = {
            let mut core = self.lock();
            if core.state != UowState::Disposed {
                core.state = outcome;
            }
            core.changes.clear();
            core.features
                .values_mut()
                .filter_map(|slot| match slot.begin_rollback() {
                    Ok(true) => Some((slot.key().to_string(), slot.feature())),
                    _ => None,
                })
                .collect()
        };

        let results = join_all(targets.into_iter().map(|(key, feature)| async move {
            feature
                .rollback()
                .await
                .map_err(|source| UowError::FeatureRollbackFailed { key, source })
        }))
        .await;

        let failures: Vec<UowError> = results.into_iter().filter_map(|r| r.err()).collect();
        for failure in &failures {
            error!(scope_id = %self.inner.id, error = %failure, "Feature rollback failed");
        }
        debug!(scope_id = %self.inner.id, state = %outcome, "Enlisted features rolled back");
        failures
    }

    /// Dispose every registered feature and move to `Disposed`.
    pub(crate) async fn dispose_features(&self) -> Vec<UowError> {
        let targets: Vec<FeatureRef> = {
            let mut core = self.lock();
            core.state = UowState::Disposed;
            core.features
                .values_mut()
                .filter_map(|slot| {
                    slot.begin_dispose()
                        .then(|| (slot.key().to_string(), slot.feature()))
                })
                .collect()
        };

        let mut failures = Vec::new();
        for (key, feature) in targets {
            if let Err(source) = feature.dispose().await {
                let failure = UowError::FeatureDisposeFailed { key, source };
                error!(scope_id = %self.inner.id, error = %failure, "Feature dispose failed");
                failures.push(failure);
            }
        }
        failures
    }

    /// Synchronous teardown for handles dropped without `dispose`. Rollback
    /// (and disposal, when `dispose` is set) is spawned on the current tokio
    /// runtime if there is one.
    pub(crate) fn abandon(&self, dispose: bool) {
        let (rollbacks, disposals) = {
            let mut core = self.lock();
            core.changes.clear();
            let rollbacks: Vec<FeatureRef> = core
                .features
                .values_mut()
                .filter_map(|slot| match slot.begin_rollback() {
                    Ok(true) => Some((slot.key().to_string(), slot.feature())),
                    _ => None,
                })
                .collect();
            let disposals: Vec<FeatureRef> = if dispose {
                core.features
                    .values_mut()
                    .filter_map(|slot| {
                        slot.begin_dispose()
                            .then(|| (slot.key().to_string(), slot.feature()))
                    })
                    .collect()
            } else {
                Vec::new()
            };
            if dispose {
                core.state = UowState::Disposed;
            } else if matches!(core.state, UowState::Active | UowState::Completing) {
                core.state = UowState::RolledBack;
            }
            (rollbacks, disposals)
        };

        if rollbacks.is_empty() && disposals.is_empty() {
            return;
        }

        let scope_id = self.inner.id.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    for (key, feature) in rollbacks {
                        if let Err(e) = feature.rollback().await {
                            error!(scope_id = %scope_id, feature_key = %key, error = %e, "Background rollback failed");
                        }
                    }
                    for (key, feature) in disposals {
                        if let Err(e) = feature.dispose().await {
                            error!(scope_id = %scope_id, feature_key = %key, error = %e, "Background dispose failed");
                        }
                    }
                });
            }
            Err(_) => {
                error!(
                    scope_id = %scope_id,
                    features = rollbacks.len(),
                    "Abandoned unit of work outside a tokio runtime, features were not rolled back"
                );
            }
        }
    }
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("options", &self.inner.options)
            .finish()
    }
}
