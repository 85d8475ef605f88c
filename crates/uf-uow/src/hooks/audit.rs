//! Audit stamping
//!
//! Stamps who and when onto every added or modified entity, using the
//! principal of the saving flow's execution context.

use async_trait::async_trait;

use crate::entity::{EntityState, TrackedEntity};
use crate::pipeline::{LifetimeHook, PreSaveHook, SaveContext};

pub const CREATED_AT: &str = "createdAt";
pub const CREATED_BY: &str = "createdBy";
pub const LAST_MODIFIED_AT: &str = "lastModifiedAt";
pub const LAST_MODIFIED_BY: &str = "lastModifiedBy";

pub struct AuditStampingHook {
    order: i32,
}

impl AuditStampingHook {
    pub const DEFAULT_ORDER: i32 = -1000;

    pub fn new() -> Self {
        Self::with_order(Self::DEFAULT_ORDER)
    }

    pub fn with_order(order: i32) -> Self {
        Self { order }
    }
}

impl Default for AuditStampingHook {
    fn default() -> Self {
        Self::new()
    }
}

impl LifetimeHook for AuditStampingHook {
    fn name(&self) -> &str {
        "audit-stamping"
    }

    fn order(&self) -> i32 {
        self.order
    }
}

#[async_trait]
impl PreSaveHook for AuditStampingHook {
    async fn pre_save_changes(
        &self,
        state: EntityState,
        entity: &mut TrackedEntity,
        ctx: &SaveContext,
    ) -> anyhow::Result<EntityState> {
        let at = ctx.now.to_rfc3339();
        let by = ctx.execution.principal_id.as_str();

        match state {
            EntityState::Added => {
                entity.set_field(CREATED_AT, at.as_str());
                entity.set_field(CREATED_BY, by);
            }
            EntityState::Modified => {
                entity.set_field(LAST_MODIFIED_AT, at.as_str());
                entity.set_field(LAST_MODIFIED_BY, by);
            }
            EntityState::Deleted | EntityState::Unchanged => {}
        }
        Ok(state)
    }
}
