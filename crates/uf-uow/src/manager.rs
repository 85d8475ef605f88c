//! Unit of Work Manager
//!
//! The only component that mutates the ambient stack. `create` interprets the
//! requested `Limit` against the current flow:
//!
//! - `Required`: join the active ambient scope, or create and push a new one
//! - `RequiresNew`: create and push a new scope, suspending the current one
//! - `Suppress`: hide the ambient scope without creating anything
//!
//! Scopes only exist inside a flow started with [`UnitOfWorkManager::flow`];
//! a `Suppress` request also succeeds outside one.

use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use uf_common::{Limit, UnitOfWorkOptions};
use uf_config::UnitflowConfig;

use crate::ambient::AmbientFlow;
use crate::context::ExecutionContext;
use crate::error::{Result, UowError};
use crate::handle::UnitOfWorkHandle;
use crate::pipeline::LifetimePipeline;
use crate::policy::PolicyTable;
use crate::unit_of_work::UnitOfWork;

pub struct UnitOfWorkManager {
    policies: PolicyTable,
    pipeline: Arc<LifetimePipeline>,
}

impl UnitOfWorkManager {
    pub fn new(defaults: UnitOfWorkOptions, pipeline: LifetimePipeline) -> Result<Self> {
        let policies = PolicyTable::builder(defaults).build()?;
        Ok(Self::with_policies(policies, pipeline))
    }

    pub fn with_policies(policies: PolicyTable, pipeline: LifetimePipeline) -> Self {
        Self {
            policies,
            pipeline: Arc::new(pipeline),
        }
    }

    pub fn from_config(config: &UnitflowConfig, pipeline: LifetimePipeline) -> Result<Self> {
        let policies =
            PolicyTable::from_config(config).map_err(|e| UowError::invalid_options(e.to_string()))?;
        Ok(Self::with_policies(policies, pipeline))
    }

    pub fn defaults(&self) -> &UnitOfWorkOptions {
        self.policies.defaults()
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    pub fn pipeline(&self) -> &LifetimePipeline {
        &self.pipeline
    }

    /// Run `fut` as one logical flow with a fresh, empty scope stack
    pub async fn flow<F>(&self, ctx: ExecutionContext, fut: F) -> F::Output
    where
        F: Future,
    {
        AmbientFlow::new(ctx).run(fut).await
    }

    /// The enlistment target of the calling flow
    pub fn current(&self) -> Option<UnitOfWork> {
        AmbientFlow::current().and_then(|flow| flow.current_scope())
    }

    pub fn create_default(&self) -> Result<UnitOfWorkHandle> {
        self.create(*self.policies.defaults())
    }

    /// Create a scope with the options registered for `operation_id`
    pub fn create_for(&self, operation_id: &str) -> Result<UnitOfWorkHandle> {
        self.create(self.policies.resolve(operation_id))
    }

    pub fn create(&self, requested: UnitOfWorkOptions) -> Result<UnitOfWorkHandle> {
        let options = requested.or_defaults(self.policies.defaults());
        options
            .validate()
            .map_err(|e| UowError::invalid_options(e.to_string()))?;
        let flow = match AmbientFlow::current() {
            Some(flow) => flow,
            // Suppression hides nothing outside a flow; its marker goes on a detached stack
            None if options.limit == Limit::Suppress => AmbientFlow::new(ExecutionContext::system()),
            None => return Err(UowError::NoAmbientFlow),
        };

        match options.limit {
            Limit::Suppress => {
                let id = flow.stack().push_suppression();
                debug!(limit = %options.limit, depth = flow.depth(), "Ambient scope suppressed");
                Ok(UnitOfWorkHandle::suppressed(id, flow))
            }
            Limit::Required => {
                let mut stack = flow.stack();
                let ambient = stack.current();
                if let Some(current) = ambient.as_ref().filter(|c| c.is_active()) {
                    if let Some(level) = requested.isolation_level {
                        if current.options().isolation_level != Some(level) {
                            return Err(UowError::invalid_options(format!(
                                "cannot join {} with isolation level {}, it runs at {}",
                                current.id(),
                                level,
                                current
                                    .options()
                                    .isolation_level
                                    .map_or("the feature default".to_string(), |l| l.to_string())
                            )));
                        }
                    }
                    if let Some(id) = stack.join_top() {
                        let current = current.clone();
                        drop(stack);
                        debug!(scope_id = %current.id(), limit = %options.limit, "Joined ambient unit of work");
                        return Ok(UnitOfWorkHandle::joined(id, current, flow));
                    }
                }
                if let Some(stale) = &ambient {
                    warn!(
                        scope_id = %stale.id(),
                        state = %stale.state(),
                        "Ambient unit of work is no longer active, starting a new one"
                    );
                }
                let scope = UnitOfWork::new(options, ambient.as_ref(), &flow, self.pipeline.clone());
                let id = stack.push_root(scope.clone());
                drop(stack);
                debug!(scope_id = %scope.id(), limit = %options.limit, depth = flow.depth(), "Unit of work created");
                Ok(UnitOfWorkHandle::root(id, scope, flow))
            }
            Limit::RequiresNew => {
                let mut stack = flow.stack();
                let suspended = stack.current();
                let scope = UnitOfWork::new(options, suspended.as_ref(), &flow, self.pipeline.clone());
                let id = stack.push_root(scope.clone());
                drop(stack);
                debug!(
                    scope_id = %scope.id(),
                    suspended = ?suspended.as_ref().map(|s| s.id().clone()),
                    limit = %options.limit,
                    "Unit of work created, ambient scope suspended"
                );
                Ok(UnitOfWorkHandle::root(id, scope, flow))
            }
        }
    }

    /// Run `operation` inside a scope: save when it succeeds, dispose always.
    /// The operation finds the scope through [`UnitOfWorkManager::current`].
    pub async fn execute<T, F, Fut>(
        &self,
        options: UnitOfWorkOptions,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut handle = self.create(options)?;

        let result = match operation().await {
            Ok(value) => handle.save_changes(cancel).await.map(|()| value),
            Err(e) => Err(match e.downcast::<UowError>() {
                Ok(uow) => uow,
                Err(other) => UowError::Operation(other),
            }),
        };
        let disposed = handle.dispose().await;

        match (result, disposed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(dispose_err)) => {
                warn!(error = %dispose_err, "Dispose failed after operation failure");
                Err(e)
            }
        }
    }

    /// `execute` with the options registered for `operation_id`
    pub async fn execute_for<T, F, Fut>(
        &self,
        operation_id: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute(self.policies.resolve(operation_id), cancel, operation)
            .await
    }
}

impl std::fmt::Debug for UnitOfWorkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkManager")
            .field("defaults", self.policies.defaults())
            .field("operations", &self.policies.len())
            .field("pre_save_hooks", &self.pipeline.pre_save_names())
            .finish()
    }
}
