//! Domain and integration events
//!
//! Before persistence, each entity's domain events are stamped with the
//! flow's tracing ids and dispatched in-process; a failed dispatch aborts the
//! save. After commit, integration events are published best-effort.

use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::EventEnvelope;
use crate::entity::{EntityState, TrackedEntity};
use crate::pipeline::{LifetimeHook, PostSaveHook, PreSaveHook, SaveContext};

/// Where events go
#[async_trait]
pub trait DomainEventDispatcher: Send + Sync {
    /// In-process handling, inside the transaction
    async fn dispatch(&self, event: &EventEnvelope) -> anyhow::Result<()>;

    /// Out-of-process publication, after commit
    async fn publish(&self, event: &EventEnvelope) -> anyhow::Result<()>;
}

/// Logs every event instead of delivering it
#[derive(Debug, Default)]
pub struct TracingDispatcher;

#[async_trait]
impl DomainEventDispatcher for TracingDispatcher {
    async fn dispatch(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            subject = %event.subject,
            correlation_id = ?event.correlation_id,
            "Domain event dispatched"
        );
        Ok(())
    }

    async fn publish(&self, event: &EventEnvelope) -> anyhow::Result<()> {
        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            subject = %event.subject,
            correlation_id = ?event.correlation_id,
            "Integration event published"
        );
        Ok(())
    }
}

pub struct DomainEventHook {
    dispatcher: Arc<dyn DomainEventDispatcher>,
    order: i32,
}

impl DomainEventHook {
    pub const DEFAULT_ORDER: i32 = 0;

    pub fn new(dispatcher: Arc<dyn DomainEventDispatcher>) -> Self {
        Self {
            dispatcher,
            order: Self::DEFAULT_ORDER,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }
}

impl LifetimeHook for DomainEventHook {
    fn name(&self) -> &str {
        "domain-events"
    }

    fn order(&self) -> i32 {
        self.order
    }
}

#[async_trait]
impl PreSaveHook for DomainEventHook {
    async fn pre_save_changes(
        &self,
        state: EntityState,
        entity: &mut TrackedEntity,
        ctx: &SaveContext,
    ) -> anyhow::Result<EntityState> {
        for event in entity.domain_events.iter_mut() {
            event.stamp(&ctx.execution);
            self.dispatcher
                .dispatch(event)
                .await
                .with_context(|| format!("dispatching {} ({})", event.event_type, event.event_id))?;
        }
        // Post-save only sees the entity immutably, so stamp these now
        for event in entity.integration_events.iter_mut() {
            event.stamp(&ctx.execution);
        }
        Ok(state)
    }
}

#[async_trait]
impl PostSaveHook for DomainEventHook {
    async fn post_save_changes(
        &self,
        _state: EntityState,
        entity: &TrackedEntity,
        ctx: &SaveContext,
    ) -> anyhow::Result<()> {
        let mut first_error = None;
        for event in &entity.integration_events {
            if let Err(e) = self.dispatcher.publish(event).await {
                warn!(
                    scope_id = %ctx.scope_id,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Integration event publish failed"
                );
                first_error.get_or_insert(e.context(format!(
                    "publishing {} for {}",
                    event.event_type,
                    entity.label()
                )));
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(())
    }
}
