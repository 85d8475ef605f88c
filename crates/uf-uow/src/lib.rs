//! Unitflow Unit of Work Engine
//!
//! Ambient, nestable transactional scopes:
//! - `UnitOfWorkManager` - creates scopes against the flow's ambient stack
//! - `UnitOfWork` / `UnitOfWorkHandle` - one physical scope and the caller's handle on it
//! - `TransactionFeature` - contract for resources enlisted into a scope
//! - `LifetimePipeline` - ordered pre/post-save hooks run at every save boundary
//!
//! ## Usage
//!
//! ```ignore
//! manager.flow(ExecutionContext::create("user-1"), async {
//!     let mut uow = manager.create(UnitOfWorkOptions::required())?;
//!     uow.track("orders-db", db.clone(), TrackedEntity::added("Order", id, data))?;
//!     uow.save_changes(&cancel).await?;
//!     uow.dispose().await
//! }).await?;
//! ```

pub mod ambient;
pub mod context;
pub mod entity;
pub mod error;
pub mod feature;
pub mod handle;
pub mod hooks;
pub mod manager;
pub mod memory;
pub mod pipeline;
pub mod policy;
pub mod unit_of_work;

pub use ambient::AmbientFlow;
pub use context::{EventEnvelope, ExecutionContext};
pub use entity::{EntityState, TrackedEntity};
pub use error::{Result, UowError};
pub use feature::{FeatureState, TransactionFeature};
pub use handle::{HandleKind, UnitOfWorkHandle};
pub use hooks::{
    standard_pipeline, AuditStampingHook, DomainEventDispatcher, DomainEventHook, SoftDeleteHook,
    TracingDispatcher,
};
pub use manager::UnitOfWorkManager;
pub use memory::{FeatureCall, FeaturePhase, InMemoryFeature};
pub use pipeline::{
    LifetimeHook, LifetimePipeline, LifetimePipelineBuilder, PostSaveHook, PreSaveHook,
    SaveContext,
};
pub use policy::{OperationPolicy, PolicyTable};
pub use unit_of_work::{ScopeId, UnitOfWork, UowState};

pub use tokio_util::sync::CancellationToken;
pub use uf_common::{IsolationLevel, Limit, UnitOfWorkOptions};
