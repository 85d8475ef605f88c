//! Save Pipeline Tests
//!
//! Tests for:
//! - Lifetime hook ordering and failure handling at the save boundary
//! - Commit / rollback fan-out and error aggregation
//! - Cancellation, timeouts and partial completion
//! - The built-in audit, soft delete and domain event hooks
//! - `execute` as the scope interceptor

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use uf_config::PipelineConfig;
use uf_uow::{
    standard_pipeline, CancellationToken, DomainEventDispatcher, EntityState, EventEnvelope,
    ExecutionContext, FeatureCall, FeaturePhase, InMemoryFeature, IsolationLevel, LifetimeHook,
    LifetimePipeline, PostSaveHook, PreSaveHook, SaveContext, TrackedEntity, UnitOfWorkManager,
    UnitOfWorkOptions, UowError, UowState,
};

/// Mock hook recording every call into a shared log
struct MockHook {
    name: String,
    order: i32,
    log: Arc<Mutex<Vec<String>>>,
    fail_pre: bool,
    fail_post: bool,
    veto_type: Option<String>,
}

impl MockHook {
    fn new(name: &str, order: i32, log: &Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            order,
            log: log.clone(),
            fail_pre: false,
            fail_post: false,
            veto_type: None,
        }
    }
}

impl LifetimeHook for MockHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn order(&self) -> i32 {
        self.order
    }
}

#[async_trait]
impl PreSaveHook for MockHook {
    async fn pre_save_changes(
        &self,
        state: EntityState,
        entity: &mut TrackedEntity,
        _ctx: &SaveContext,
    ) -> anyhow::Result<EntityState> {
        self.log
            .lock()
            .push(format!("pre:{}:{}", self.name, entity.entity_id));
        if self.fail_pre {
            anyhow::bail!("{} rejected {}", self.name, entity.label());
        }
        if self.veto_type.as_deref() == Some(entity.entity_type.as_str()) {
            return Ok(EntityState::Unchanged);
        }
        Ok(state)
    }
}

#[async_trait]
impl PostSaveHook for MockHook {
    async fn post_save_changes(
        &self,
        _state: EntityState,
        entity: &TrackedEntity,
        _ctx: &SaveContext,
    ) -> anyhow::Result<()> {
        self.log
            .lock()
            .push(format!("post:{}:{}", self.name, entity.entity_id));
        if self.fail_post {
            anyhow::bail!("{} could not publish", self.name);
        }
        Ok(())
    }
}

/// Mock dispatcher counting deliveries
#[derive(Default)]
struct MockDispatcher {
    dispatched: AtomicU32,
    published: AtomicU32,
    fail_dispatch: bool,
}

#[async_trait]
impl DomainEventDispatcher for MockDispatcher {
    async fn dispatch(&self, _event: &EventEnvelope) -> anyhow::Result<()> {
        if self.fail_dispatch {
            anyhow::bail!("no handler accepted the event");
        }
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, _event: &EventEnvelope) -> anyhow::Result<()> {
        self.published.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn manager_with(pipeline: LifetimePipeline) -> UnitOfWorkManager {
    UnitOfWorkManager::new(UnitOfWorkOptions::required(), pipeline).unwrap()
}

fn ctx() -> ExecutionContext {
    ExecutionContext::create("user-1")
}

fn order(id: &str) -> TrackedEntity {
    TrackedEntity::added("Order", id, json!({ "total": 10 }))
}

#[tokio::test]
async fn test_pre_save_hooks_run_in_ascending_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let pipeline = LifetimePipeline::builder()
        .pre_save(Arc::new(MockHook::new("ten", 10, &log)))
        .pre_save(Arc::new(MockHook::new("minus-thousand", -1000, &log)))
        .pre_save(Arc::new(MockHook::new("five", 5, &log)))
        .build();
    let manager = manager_with(pipeline);
    let db = InMemoryFeature::new("db");

    manager
        .flow(ctx(), async {
            let mut handle = manager.create_default().unwrap();
            handle.track("db", db.clone(), order("1")).unwrap();
            handle.save_changes(&CancellationToken::new()).await.unwrap();
            handle.dispose().await.unwrap();
        })
        .await;

    assert_eq!(
        *log.lock(),
        vec!["pre:minus-thousand:1", "pre:five:1", "pre:ten:1"]
    );
}

#[tokio::test]
async fn test_hook_failure_rolls_back_enlisted_features() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut failing = MockHook::new("auditor", 0, &log);
    failing.fail_pre = true;
    let manager = manager_with(LifetimePipeline::builder().pre_save(Arc::new(failing)).build());

    let f1 = InMemoryFeature::new("f1");
    let f2 = InMemoryFeature::new("f2");

    manager
        .flow(ctx(), async {
            let mut handle = manager.create_default().unwrap();
            handle.enlist("f1", f1.clone()).await.unwrap();
            handle.track("f2", f2.clone(), order("7")).unwrap();

            let err = handle
                .save_changes(&CancellationToken::new())
                .await
                .unwrap_err();
            match &err {
                UowError::HookFailed { hook, entity, .. } => {
                    assert_eq!(hook, "auditor");
                    assert_eq!(entity, "Order#7");
                }
                other => panic!("expected HookFailed, got {other:?}"),
            }
            assert_eq!(handle.state(), Some(UowState::RolledBack));
            handle.dispose().await.unwrap();
        })
        .await;

    assert!(f1.was_rolled_back());
    assert!(!f1.was_committed());
    assert!(!f2.was_enlisted());
}

#[tokio::test]
async fn test_rolled_back_scope_releases_tracked_keys() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut failing = MockHook::new("validator", 0, &log);
    failing.fail_pre = true;
    let manager = manager_with(LifetimePipeline::builder().pre_save(Arc::new(failing)).build());
    let first = InMemoryFeature::new("db-first");
    let second = InMemoryFeature::new("db-second");

    manager
        .flow(ctx(), async {
            let mut outer = manager.create_default().unwrap();
            outer.track("db", first.clone(), order("1")).unwrap();
            let err = outer
                .save_changes(&CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "HOOK_FAILED");
            assert_eq!(outer.state(), Some(UowState::RolledBack));

            let mut inner = manager.create(UnitOfWorkOptions::requires_new()).unwrap();
            inner.enlist("db", second.clone()).await.unwrap();
            inner.save_changes(&CancellationToken::new()).await.unwrap();
            inner.dispose().await.unwrap();
            outer.dispose().await.unwrap();
        })
        .await;

    assert!(second.was_committed());
    assert!(!first.was_enlisted());
}

#[tokio::test]
async fn test_post_save_failure_does_not_undo_commit() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut publisher = MockHook::new("publisher", 0, &log);
    publisher.fail_post = true;
    let manager = manager_with(LifetimePipeline::builder().hook(Arc::new(publisher)).build());
    let db = InMemoryFeature::new("db");

    manager
        .flow(ctx(), async {
            let mut handle = manager.create_default().unwrap();
            handle.track("db", db.clone(), order("1")).unwrap();
            handle.track("db", db.clone(), order("2")).unwrap();
            handle.save_changes(&CancellationToken::new()).await.unwrap();
            assert_eq!(handle.state(), Some(UowState::Committed));
            handle.dispose().await.unwrap();
        })
        .await;

    assert_eq!(db.committed_entities().len(), 2);
    assert_eq!(db.count(FeatureCall::is_enlist), 1);
    assert!(log.lock().contains(&"post:publisher:2".to_string()));
}

#[tokio::test]
async fn test_vetoed_entities_are_not_persisted() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut veto = MockHook::new("drafts", 0, &log);
    veto.veto_type = Some("Draft".to_string());
    let manager = manager_with(LifetimePipeline::builder().pre_save(Arc::new(veto)).build());
    let orders = InMemoryFeature::new("orders");
    let drafts = InMemoryFeature::new("drafts");

    manager
        .flow(ctx(), async {
            let mut handle = manager.create_default().unwrap();
            handle.track("orders", orders.clone(), order("1")).unwrap();
            handle
                .track("drafts", drafts.clone(), TrackedEntity::added("Draft", "d-1", json!({})))
                .unwrap();
            handle.save_changes(&CancellationToken::new()).await.unwrap();
            handle.dispose().await.unwrap();
        })
        .await;

    assert_eq!(orders.committed_entities().len(), 1);
    assert!(!drafts.was_enlisted());
    assert_eq!(drafts.calls(), vec![FeatureCall::Dispose]);
}

#[tokio::test]
async fn test_commits_run_in_enlistment_order() {
    let manager = manager_with(LifetimePipeline::empty());
    let journal = uf_uow::memory::Journal::default();
    let first = InMemoryFeature::with_journal("first", &journal);
    let second = InMemoryFeature::with_journal("second", &journal);

    manager
        .flow(ctx(), async {
            let mut handle = manager.create_default().unwrap();
            handle.enlist("first", first.clone()).await.unwrap();
            handle.enlist("second", second.clone()).await.unwrap();
            handle.save_changes(&CancellationToken::new()).await.unwrap();
            handle.dispose().await.unwrap();
        })
        .await;

    assert_eq!(
        *journal.lock(),
        vec![
            "first:enlist",
            "second:enlist",
            "first:commit",
            "second:commit",
            "first:dispose",
            "second:dispose",
        ]
    );
}

#[tokio::test]
async fn test_isolation_level_reaches_features() {
    let manager = manager_with(LifetimePipeline::empty());
    let db = InMemoryFeature::new("db");

    manager
        .flow(ctx(), async {
            let mut handle = manager
                .create(UnitOfWorkOptions::required().with_isolation_level(IsolationLevel::Serializable))
                .unwrap();
            handle.enlist("db", db.clone()).await.unwrap();
            handle.dispose().await.unwrap();
        })
        .await;

    assert_eq!(db.enlisted_isolation(), Some(IsolationLevel::Serializable));
}

#[tokio::test]
async fn test_cancel_before_commit_is_clean() {
    let manager = manager_with(LifetimePipeline::empty());
    let db = InMemoryFeature::new("db");

    manager
        .flow(ctx(), async {
            let mut handle = manager.create_default().unwrap();
            handle.track("db", db.clone(), order("1")).unwrap();

            let cancel = CancellationToken::new();
            cancel.cancel();
            let err = handle.save_changes(&cancel).await.unwrap_err();
            assert!(matches!(err, UowError::Cancelled));
            assert!(!err.is_partial());
            handle.dispose().await.unwrap();
        })
        .await;

    assert!(!db.was_committed());
    assert!(db.committed_entities().is_empty());
}

#[tokio::test]
async fn test_cancel_after_first_commit_is_partial() {
    let manager = manager_with(LifetimePipeline::empty());
    let first = InMemoryFeature::new("first");
    let second = InMemoryFeature::new("second");
    let cancel = CancellationToken::new();
    first.cancel_after_commit(cancel.clone());

    manager
        .flow(ctx(), async {
            let mut handle = manager.create_default().unwrap();
            handle.enlist("first", first.clone()).await.unwrap();
            handle.enlist("second", second.clone()).await.unwrap();

            let err = handle.save_changes(&cancel).await.unwrap_err();
            assert!(err.is_partial());
            match err {
                UowError::PartialCompletion { committed, not_committed, cause } => {
                    assert_eq!(committed, vec!["first"]);
                    assert_eq!(not_committed, vec!["second"]);
                    assert!(matches!(*cause, UowError::Cancelled));
                }
                other => panic!("expected PartialCompletion, got {other:?}"),
            }
            assert_eq!(handle.state(), Some(UowState::PartiallyCommitted));
            handle.dispose().await.unwrap();
            assert_eq!(handle.state(), Some(UowState::Disposed));
        })
        .await;

    assert!(first.was_committed());
    assert!(!first.was_rolled_back());
    assert!(second.was_rolled_back());
    assert!(!second.was_committed());
}

#[tokio::test]
async fn test_timeout_measured_from_creation() {
    let manager = manager_with(LifetimePipeline::empty());
    let db = InMemoryFeature::new("db");

    manager
        .flow(ctx(), async {
            let mut handle = manager
                .create(UnitOfWorkOptions::required().with_timeout(Duration::from_millis(20)))
                .unwrap();
            handle.enlist("db", db.clone()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(40)).await;

            let err = handle
                .save_changes(&CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "TIMED_OUT");
            assert_eq!(handle.state(), Some(UowState::RolledBack));
            handle.dispose().await.unwrap();
        })
        .await;

    assert!(db.was_rolled_back());
}

#[tokio::test]
async fn test_save_failure_with_rollback_failure_aggregates() {
    let manager = manager_with(LifetimePipeline::empty());
    let healthy = InMemoryFeature::new("healthy");
    let broken = InMemoryFeature::new("broken");
    let stuck = InMemoryFeature::new("stuck");
    broken.fail_on(FeaturePhase::Save);
    stuck.fail_on(FeaturePhase::Rollback);

    manager
        .flow(ctx(), async {
            let mut handle = manager.create_default().unwrap();
            handle.enlist("stuck", stuck.clone()).await.unwrap();
            handle.track("healthy", healthy.clone(), order("1")).unwrap();
            handle.track("broken", broken.clone(), order("2")).unwrap();

            let err = handle
                .save_changes(&CancellationToken::new())
                .await
                .unwrap_err();
            assert_eq!(err.code(), "AGGREGATE");
            assert_eq!(err.primary().code(), "FEATURE_SAVE_FAILED");
            let text = err.to_string();
            assert!(text.contains("broken refused to save"));
            assert!(text.contains("stuck refused to rollback"));
            handle.dispose().await.unwrap();
        })
        .await;

    assert!(healthy.was_rolled_back());
    assert!(broken.was_rolled_back());
    assert!(!healthy.was_committed());
}

#[tokio::test]
async fn test_standard_pipeline_stamps_and_soft_deletes() {
    let config = PipelineConfig {
        soft_delete_entity_types: vec!["Customer".to_string()],
        ..Default::default()
    };
    let dispatcher = Arc::new(MockDispatcher::default());
    let manager = manager_with(standard_pipeline(&config, dispatcher.clone()).build());
    let db = InMemoryFeature::new("db");

    manager
        .flow(ExecutionContext::with_correlation("clerk-5", "corr-77"), async {
            let mut handle = manager.create_default().unwrap();
            handle
                .track(
                    "db",
                    db.clone(),
                    order("1")
                        .with_domain_event(EventEnvelope::new(
                            "shop:orders:order:placed",
                            "orders.order.1",
                            json!({}),
                        ))
                        .with_integration_event(EventEnvelope::new(
                            "shop:orders:order:announced",
                            "orders.order.1",
                            json!({}),
                        )),
                )
                .unwrap();
            handle
                .track("db", db.clone(), TrackedEntity::deleted("Customer", "c-1"))
                .unwrap();
            handle.save_changes(&CancellationToken::new()).await.unwrap();
            handle.dispose().await.unwrap();
        })
        .await;

    let saved = db.committed_entities();
    assert_eq!(saved.len(), 2);

    let order = saved.iter().find(|e| e.entity_type == "Order").unwrap();
    assert_eq!(order.field("createdBy"), Some(&json!("clerk-5")));
    assert_eq!(
        order.integration_events[0].correlation_id.as_deref(),
        Some("corr-77")
    );

    let customer = saved.iter().find(|e| e.entity_type == "Customer").unwrap();
    assert_eq!(customer.state, EntityState::Modified);
    assert_eq!(customer.field("isDeleted"), Some(&json!(true)));
    assert_eq!(customer.field("deletedBy"), Some(&json!("clerk-5")));

    assert_eq!(dispatcher.dispatched.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.published.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_domain_event_failure_aborts_save() {
    let dispatcher = Arc::new(MockDispatcher {
        fail_dispatch: true,
        ..Default::default()
    });
    let manager = manager_with(standard_pipeline(&PipelineConfig::default(), dispatcher).build());
    let db = InMemoryFeature::new("db");

    manager
        .flow(ctx(), async {
            let mut handle = manager.create_default().unwrap();
            handle
                .track(
                    "db",
                    db.clone(),
                    order("1").with_domain_event(EventEnvelope::new(
                        "shop:orders:order:placed",
                        "orders.order.1",
                        json!({}),
                    )),
                )
                .unwrap();
            let err = handle
                .save_changes(&CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, UowError::HookFailed { ref hook, .. } if hook == "domain-events"));
            handle.dispose().await.unwrap();
        })
        .await;

    assert!(db.committed_entities().is_empty());
}

#[tokio::test]
async fn test_execute_saves_on_success() {
    let manager = manager_with(LifetimePipeline::empty());
    let db = InMemoryFeature::new("db");

    let value = manager
        .flow(ctx(), async {
            let mgr = &manager;
            let feature = db.clone();
            manager
                .execute(UnitOfWorkOptions::required(), &CancellationToken::new(), move || async move {
                    let uow = mgr
                        .current()
                        .ok_or_else(|| anyhow::anyhow!("no ambient unit of work"))?;
                    uow.track("db", feature, order("1"))?;
                    Ok::<_, anyhow::Error>(42)
                })
                .await
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(db.committed_entities().len(), 1);
    assert_eq!(db.count(FeatureCall::is_dispose), 1);
}

#[tokio::test]
async fn test_execute_rolls_back_on_failure() {
    let manager = manager_with(LifetimePipeline::empty());
    let db = InMemoryFeature::new("db");

    let err = manager
        .flow(ctx(), async {
            let mgr = &manager;
            let feature = db.clone();
            manager
                .execute(UnitOfWorkOptions::required(), &CancellationToken::new(), move || async move {
                    let uow = mgr
                        .current()
                        .ok_or_else(|| anyhow::anyhow!("no ambient unit of work"))?;
                    uow.enlist("db", feature).await?;
                    Err::<(), _>(anyhow::anyhow!("inventory check failed"))
                })
                .await
        })
        .await
        .unwrap_err();

    assert!(matches!(err, UowError::Operation(_)));
    assert!(err.to_string().contains("inventory check failed"));
    assert!(db.was_rolled_back());
    assert!(!db.was_committed());
}

#[tokio::test]
async fn test_execute_surfaces_engine_errors_unwrapped() {
    let manager = manager_with(LifetimePipeline::empty());
    let db = InMemoryFeature::new("db");
    db.fail_on(FeaturePhase::Enlist);

    let err = manager
        .flow(ctx(), async {
            let mgr = &manager;
            let feature = db.clone();
            manager
                .execute(UnitOfWorkOptions::required(), &CancellationToken::new(), move || async move {
                    let uow = mgr
                        .current()
                        .ok_or_else(|| anyhow::anyhow!("no ambient unit of work"))?;
                    uow.enlist("db", feature).await?;
                    Ok::<_, anyhow::Error>(())
                })
                .await
        })
        .await
        .unwrap_err();

    assert!(matches!(err, UowError::FeatureEnlistmentFailed { ref key, .. } if key == "db"));
}
