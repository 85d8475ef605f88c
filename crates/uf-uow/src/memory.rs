//! In-memory transaction feature
//!
//! Stages saved entities and makes them visible on commit. Records every
//! contract call and can be told to fail any phase, which makes it the
//! feature of choice for the dev binary and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use uf_common::{IsolationLevel, UnitOfWorkOptions};

use crate::entity::TrackedEntity;
use crate::feature::TransactionFeature;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeaturePhase {
    Enlist,
    Save,
    Commit,
    Rollback,
    Dispose,
}

impl FeaturePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeaturePhase::Enlist => "enlist",
            FeaturePhase::Save => "save",
            FeaturePhase::Commit => "commit",
            FeaturePhase::Rollback => "rollback",
            FeaturePhase::Dispose => "dispose",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureCall {
    Enlist(Option<IsolationLevel>),
    /// Number of entities handed over
    Save(usize),
    Commit,
    Rollback,
    Dispose,
}

impl FeatureCall {
    pub fn phase(&self) -> FeaturePhase {
        match self {
            FeatureCall::Enlist(_) => FeaturePhase::Enlist,
            FeatureCall::Save(_) => FeaturePhase::Save,
            FeatureCall::Commit => FeaturePhase::Commit,
            FeatureCall::Rollback => FeaturePhase::Rollback,
            FeatureCall::Dispose => FeaturePhase::Dispose,
        }
    }

    pub fn is_enlist(&self) -> bool {
        self.phase() == FeaturePhase::Enlist
    }

    pub fn is_commit(&self) -> bool {
        self.phase() == FeaturePhase::Commit
    }

    pub fn is_rollback(&self) -> bool {
        self.phase() == FeaturePhase::Rollback
    }

    pub fn is_dispose(&self) -> bool {
        self.phase() == FeaturePhase::Dispose
    }
}

/// Shared, ordered record of calls across several features: `"name:phase"`
pub type Journal = Arc<Mutex<Vec<String>>>;

pub struct InMemoryFeature {
    name: String,
    calls: Mutex<Vec<FeatureCall>>,
    staged: Mutex<Vec<TrackedEntity>>,
    committed: Mutex<Vec<TrackedEntity>>,
    failures: Mutex<HashSet<FeaturePhase>>,
    cancel_on_commit: Mutex<Option<CancellationToken>>,
    journal: Option<Journal>,
}

impl InMemoryFeature {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::build(name.into(), None))
    }

    /// Also append every call to `journal`
    pub fn with_journal(name: impl Into<String>, journal: &Journal) -> Arc<Self> {
        Arc::new(Self::build(name.into(), Some(journal.clone())))
    }

    fn build(name: String, journal: Option<Journal>) -> Self {
        Self {
            name,
            calls: Mutex::new(Vec::new()),
            staged: Mutex::new(Vec::new()),
            committed: Mutex::new(Vec::new()),
            failures: Mutex::new(HashSet::new()),
            cancel_on_commit: Mutex::new(None),
            journal,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make every later call of `phase` fail
    pub fn fail_on(&self, phase: FeaturePhase) {
        self.failures.lock().insert(phase);
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Cancel `token` once this feature has committed
    pub fn cancel_after_commit(&self, token: CancellationToken) {
        *self.cancel_on_commit.lock() = Some(token);
    }

    pub fn calls(&self) -> Vec<FeatureCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&FeatureCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(*c)).count()
    }

    pub fn was_enlisted(&self) -> bool {
        self.count(FeatureCall::is_enlist) > 0
    }

    pub fn was_committed(&self) -> bool {
        self.count(FeatureCall::is_commit) > 0
    }

    pub fn was_rolled_back(&self) -> bool {
        self.count(FeatureCall::is_rollback) > 0
    }

    /// Isolation level of the last enlistment
    pub fn enlisted_isolation(&self) -> Option<IsolationLevel> {
        self.calls.lock().iter().rev().find_map(|c| match c {
            FeatureCall::Enlist(level) => *level,
            _ => None,
        })
    }

    pub fn committed_entities(&self) -> Vec<TrackedEntity> {
        self.committed.lock().clone()
    }

    fn record(&self, call: FeatureCall) -> anyhow::Result<()> {
        let phase = call.phase();
        self.calls.lock().push(call);
        if let Some(journal) = &self.journal {
            journal.lock().push(format!("{}:{}", self.name, phase.as_str()));
        }
        if self.failures.lock().contains(&phase) {
            anyhow::bail!("{} refused to {}", self.name, phase.as_str());
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionFeature for InMemoryFeature {
    async fn enlist(&self, options: &UnitOfWorkOptions) -> anyhow::Result<()> {
        self.record(FeatureCall::Enlist(options.isolation_level))
    }

    async fn save_changes(&self, changes: &[TrackedEntity]) -> anyhow::Result<()> {
        self.record(FeatureCall::Save(changes.len()))?;
        self.staged.lock().extend_from_slice(changes);
        Ok(())
    }

    async fn commit(&self) -> anyhow::Result<()> {
        self.record(FeatureCall::Commit)?;
        let staged = std::mem::take(&mut *self.staged.lock());
        debug!(feature = %self.name, entities = staged.len(), "In-memory commit");
        self.committed.lock().extend(staged);

        if let Some(token) = self.cancel_on_commit.lock().take() {
            token.cancel();
        }
        Ok(())
    }

    async fn rollback(&self) -> anyhow::Result<()> {
        self.staged.lock().clear();
        self.record(FeatureCall::Rollback)
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.record(FeatureCall::Dispose)
    }
}

impl std::fmt::Debug for InMemoryFeature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryFeature")
            .field("name", &self.name)
            .field("calls", &self.calls.lock().len())
            .field("committed", &self.committed.lock().len())
            .finish()
    }
}
