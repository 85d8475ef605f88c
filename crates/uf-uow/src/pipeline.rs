//! Repository Lifetime Pipeline
//!
//! Ordered hooks that run around persistence of every changed entity,
//! regardless of which feature writes it. A hook implements `PreSaveHook`,
//! `PostSaveHook`, or both. Hooks run sequentially in ascending `order`,
//! ties broken by registration order. The hook list is fixed once built.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use uf_common::UnitOfWorkOptions;

use crate::context::ExecutionContext;
use crate::entity::{EntityState, TrackedEntity};
use crate::error::{Result, UowError};
use crate::unit_of_work::ScopeId;

/// What a hook sees about the save it runs in.
#[derive(Debug, Clone)]
pub struct SaveContext {
    pub scope_id: ScopeId,
    pub options: UnitOfWorkOptions,
    pub execution: ExecutionContext,
    /// One timestamp per save, so every stamp in a change set agrees
    pub now: DateTime<Utc>,
}

pub trait LifetimeHook: Send + Sync {
    fn name(&self) -> &str;

    /// Lower runs first
    fn order(&self) -> i32 {
        0
    }
}

#[async_trait]
pub trait PreSaveHook: LifetimeHook {
    /// May rewrite the entity and return a new state. Returning
    /// `EntityState::Unchanged` drops the entity from the save; returning an
    /// error aborts and rolls back the whole scope.
    async fn pre_save_changes(
        &self,
        state: EntityState,
        entity: &mut TrackedEntity,
        ctx: &SaveContext,
    ) -> anyhow::Result<EntityState>;
}

#[async_trait]
pub trait PostSaveHook: LifetimeHook {
    /// Runs after commit. Failures are logged and never undo the save.
    async fn post_save_changes(
        &self,
        state: EntityState,
        entity: &TrackedEntity,
        ctx: &SaveContext,
    ) -> anyhow::Result<()>;
}

struct Registered<H: ?Sized> {
    seq: usize,
    hook: Arc<H>,
}

pub struct LifetimePipeline {
    pre_save: Vec<Registered<dyn PreSaveHook>>,
    post_save: Vec<Registered<dyn PostSaveHook>>,
}

impl LifetimePipeline {
    pub fn builder() -> LifetimePipelineBuilder {
        LifetimePipelineBuilder::default()
    }

    /// A pipeline with no hooks
    pub fn empty() -> Self {
        Self::builder().build()
    }

    pub fn is_empty(&self) -> bool {
        self.pre_save.is_empty() && self.post_save.is_empty()
    }

    /// Names of pre-save hooks in execution order
    pub fn pre_save_names(&self) -> Vec<String> {
        self.pre_save.iter().map(|r| r.hook.name().to_string()).collect()
    }

    /// Names of post-save hooks in execution order
    pub fn post_save_names(&self) -> Vec<String> {
        self.post_save.iter().map(|r| r.hook.name().to_string()).collect()
    }

    /// Run every pre-save hook over one entity. Stops early when a hook drops
    /// the entity. The entity's `state` is kept in sync after each hook.
    pub async fn run_pre_save(&self, entity: &mut TrackedEntity, ctx: &SaveContext) -> Result<EntityState> {
        let mut state = entity.state;
        for registered in &self.pre_save {
            let hook = &registered.hook;
            state = hook
                .pre_save_changes(state, entity, ctx)
                .await
                .map_err(|source| UowError::HookFailed {
                    hook: hook.name().to_string(),
                    entity: entity.label(),
                    source,
                })?;
            entity.state = state;

            if !state.is_pending() {
                debug!(
                    scope_id = %ctx.scope_id,
                    hook = hook.name(),
                    entity = %entity.label(),
                    "Entity dropped from change set by pre-save hook"
                );
                break;
            }
        }
        Ok(state)
    }

    /// Run every post-save hook over one entity, best-effort. Returns the
    /// number of hooks that failed.
    pub async fn run_post_save(&self, entity: &TrackedEntity, ctx: &SaveContext) -> usize {
        let mut failures = 0;
        for registered in &self.post_save {
            let hook = &registered.hook;
            if let Err(e) = hook.post_save_changes(entity.state, entity, ctx).await {
                failures += 1;
                warn!(
                    scope_id = %ctx.scope_id,
                    hook = hook.name(),
                    entity = %entity.label(),
                    error = %e,
                    "Post-save hook failed, save result stands"
                );
            }
        }
        failures
    }
}

impl Default for LifetimePipeline {
    fn default() -> Self {
        Self::empty()
    }
}

#[derive(Default)]
pub struct LifetimePipelineBuilder {
    pre_save: Vec<Registered<dyn PreSaveHook>>,
    post_save: Vec<Registered<dyn PostSaveHook>>,
    next_seq: usize,
}

impl LifetimePipelineBuilder {
    fn seq(&mut self) -> usize {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    pub fn pre_save(mut self, hook: Arc<dyn PreSaveHook>) -> Self {
        let seq = self.seq();
        self.pre_save.push(Registered { seq, hook });
        self
    }

    pub fn post_save(mut self, hook: Arc<dyn PostSaveHook>) -> Self {
        let seq = self.seq();
        self.post_save.push(Registered { seq, hook });
        self
    }

    /// Register a hook that implements both phases
    pub fn hook<H>(mut self, hook: Arc<H>) -> Self
    where
        H: PreSaveHook + PostSaveHook + 'static,
    {
        let seq = self.seq();
        let pre: Arc<dyn PreSaveHook> = hook.clone();
        let post: Arc<dyn PostSaveHook> = hook;
        self.pre_save.push(Registered { seq, hook: pre });
        self.post_save.push(Registered { seq, hook: post });
        self
    }

    pub fn build(mut self) -> LifetimePipeline {
        self.pre_save.sort_by_key(|r| (r.hook.order(), r.seq));
        self.post_save.sort_by_key(|r| (r.hook.order(), r.seq));
        LifetimePipeline {
            pre_save: self.pre_save,
            post_save: self.post_save,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    struct Recording {
        name: String,
        order: i32,
        log: Arc<Mutex<Vec<String>>>,
        result: Option<EntityState>,
        fail: bool,
    }

    impl Recording {
        fn new(name: &str, order: i32, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                order,
                log: log.clone(),
                result: None,
                fail: false,
            }
        }
    }

    impl LifetimeHook for Recording {
        fn name(&self) -> &str {
            &self.name
        }
        fn order(&self) -> i32 {
            self.order
        }
    }

    #[async_trait]
    impl PreSaveHook for Recording {
        async fn pre_save_changes(
            &self,
            state: EntityState,
            _entity: &mut TrackedEntity,
            _ctx: &SaveContext,
        ) -> anyhow::Result<EntityState> {
            self.log.lock().push(format!("pre:{}", self.name));
            if self.fail {
                anyhow::bail!("{} refused", self.name);
            }
            Ok(self.result.unwrap_or(state))
        }
    }

    #[async_trait]
    impl PostSaveHook for Recording {
        async fn post_save_changes(
            &self,
            _state: EntityState,
            _entity: &TrackedEntity,
            _ctx: &SaveContext,
        ) -> anyhow::Result<()> {
            self.log.lock().push(format!("post:{}", self.name));
            if self.fail {
                anyhow::bail!("{} refused", self.name);
            }
            Ok(())
        }
    }

    fn ctx() -> SaveContext {
        SaveContext {
            scope_id: ScopeId::generate(),
            options: UnitOfWorkOptions::required(),
            execution: ExecutionContext::create("tester"),
            now: Utc::now(),
        }
    }

    #[test]
    fn test_pre_save_runs_in_ascending_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = LifetimePipeline::builder()
            .pre_save(Arc::new(Recording::new("ten", 10, &log)))
            .pre_save(Arc::new(Recording::new("minus-thousand", -1000, &log)))
            .pre_save(Arc::new(Recording::new("five", 5, &log)))
            .build();

        let mut entity = TrackedEntity::added("Order", "1", json!({}));
        tokio_test::block_on(pipeline.run_pre_save(&mut entity, &ctx())).unwrap();

        assert_eq!(
            *log.lock(),
            vec!["pre:minus-thousand", "pre:five", "pre:ten"]
        );
    }

    #[test]
    fn test_ties_keep_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = LifetimePipeline::builder()
            .pre_save(Arc::new(Recording::new("b", 0, &log)))
            .pre_save(Arc::new(Recording::new("a", 0, &log)))
            .pre_save(Arc::new(Recording::new("c", 0, &log)))
            .build();

        assert_eq!(pipeline.pre_save_names(), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_hook_failure_maps_to_hook_failed() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Recording::new("auditor", 0, &log);
        failing.fail = true;
        let pipeline = LifetimePipeline::builder()
            .pre_save(Arc::new(failing))
            .pre_save(Arc::new(Recording::new("after", 1, &log)))
            .build();

        let mut entity = TrackedEntity::added("Order", "9", json!({}));
        let err = pipeline.run_pre_save(&mut entity, &ctx()).await.unwrap_err();

        match err {
            UowError::HookFailed { hook, entity, .. } => {
                assert_eq!(hook, "auditor");
                assert_eq!(entity, "Order#9");
            }
            other => panic!("expected HookFailed, got {other:?}"),
        }
        assert_eq!(*log.lock(), vec!["pre:auditor"]);
    }

    #[tokio::test]
    async fn test_unchanged_drops_entity_and_stops() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut veto = Recording::new("veto", 0, &log);
        veto.result = Some(EntityState::Unchanged);
        let pipeline = LifetimePipeline::builder()
            .pre_save(Arc::new(veto))
            .pre_save(Arc::new(Recording::new("never", 1, &log)))
            .build();

        let mut entity = TrackedEntity::modified("Order", "3", json!({}));
        let state = pipeline.run_pre_save(&mut entity, &ctx()).await.unwrap();

        assert_eq!(state, EntityState::Unchanged);
        assert_eq!(entity.state, EntityState::Unchanged);
        assert_eq!(*log.lock(), vec!["pre:veto"]);
    }

    #[tokio::test]
    async fn test_post_save_failures_are_counted_not_raised() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut failing = Recording::new("publisher", 0, &log);
        failing.fail = true;
        let pipeline = LifetimePipeline::builder()
            .hook(Arc::new(failing))
            .post_save(Arc::new(Recording::new("metrics", 5, &log)))
            .build();

        let entity = TrackedEntity::added("Order", "4", json!({}));
        let failures = pipeline.run_post_save(&entity, &ctx()).await;

        assert_eq!(failures, 1);
        assert_eq!(*log.lock(), vec!["post:publisher", "post:metrics"]);
        assert_eq!(pipeline.pre_save_names(), vec!["publisher"]);
    }
}
