//! Built-in lifetime hooks

pub mod audit;
pub mod domain_events;
pub mod soft_delete;

pub use audit::AuditStampingHook;
pub use domain_events::{DomainEventDispatcher, DomainEventHook, TracingDispatcher};
pub use soft_delete::SoftDeleteHook;

use std::sync::Arc;

use uf_config::PipelineConfig;

use crate::pipeline::{LifetimePipeline, LifetimePipelineBuilder};

/// Register the built-in hooks enabled in `config`. Returns the builder so
/// application hooks can be added before `build()`.
pub fn standard_pipeline(
    config: &PipelineConfig,
    dispatcher: Arc<dyn DomainEventDispatcher>,
) -> LifetimePipelineBuilder {
    let mut builder = LifetimePipeline::builder();

    if config.audit_enabled {
        builder = builder.pre_save(Arc::new(AuditStampingHook::with_order(config.audit_order)));
    }
    if config.soft_delete_enabled && !config.soft_delete_entity_types.is_empty() {
        builder = builder.pre_save(Arc::new(
            SoftDeleteHook::new(config.soft_delete_entity_types.iter().cloned())
                .with_order(config.soft_delete_order),
        ));
    }
    if config.domain_events_enabled {
        builder = builder.hook(Arc::new(
            DomainEventHook::new(dispatcher).with_order(config.domain_events_order),
        ));
    }
    builder
}
