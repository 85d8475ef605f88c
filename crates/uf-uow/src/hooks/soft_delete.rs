//! Soft deletion
//!
//! Deletes of configured entity types are rewritten into updates that flag
//! the entity as deleted, so the row survives for audit and restore.

use async_trait::async_trait;
use std::collections::HashSet;
use tracing::debug;

use crate::entity::{EntityState, TrackedEntity};
use crate::pipeline::{LifetimeHook, PreSaveHook, SaveContext};

pub const IS_DELETED: &str = "isDeleted";
pub const DELETED_AT: &str = "deletedAt";
pub const DELETED_BY: &str = "deletedBy";

pub struct SoftDeleteHook {
    entity_types: HashSet<String>,
    order: i32,
}

impl SoftDeleteHook {
    pub const DEFAULT_ORDER: i32 = -500;

    pub fn new<I, S>(entity_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entity_types: entity_types.into_iter().map(Into::into).collect(),
            order: Self::DEFAULT_ORDER,
        }
    }

    pub fn with_order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn applies_to(&self, entity_type: &str) -> bool {
        self.entity_types.contains(entity_type)
    }
}

impl LifetimeHook for SoftDeleteHook {
    fn name(&self) -> &str {
        "soft-delete"
    }

    fn order(&self) -> i32 {
        self.order
    }
}

#[async_trait]
impl PreSaveHook for SoftDeleteHook {
    async fn pre_save_changes(
        &self,
        state: EntityState,
        entity: &mut TrackedEntity,
        ctx: &SaveContext,
    ) -> anyhow::Result<EntityState> {
        if state != EntityState::Deleted || !self.applies_to(&entity.entity_type) {
            return Ok(state);
        }

        entity.set_field(IS_DELETED, true);
        entity.set_field(DELETED_AT, ctx.now.to_rfc3339());
        entity.set_field(DELETED_BY, ctx.execution.principal_id.as_str());

        debug!(
            scope_id = %ctx.scope_id,
            entity_type = %entity.entity_type,
            entity_id = %entity.entity_id,
            "Delete rewritten as soft delete"
        );
        Ok(EntityState::Modified)
    }
}
