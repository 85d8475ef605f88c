//! Ambient Scope Stack
//!
//! Flow-local record of which unit of work is "current". The stack lives in a
//! tokio task-local, so it follows one logical operation across `.await`
//! points and is not inherited by `tokio::spawn`ed tasks.
//!
//! The stack holds one frame per physical scope. Joined handles are counted
//! on the frame they joined; suppressed handles are markers that hide the
//! frames below them without pushing anything. Every LIFO rule is checked
//! here so a misordered dispose is reported instead of corrupting the stack.

use parking_lot::{Mutex, MutexGuard};
use std::future::Future;
use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::{Result, UowError};
use crate::unit_of_work::{ScopeId, UnitOfWork};

tokio::task_local! {
    static AMBIENT_FLOW: Arc<AmbientFlow>;
}

/// Identity of one handle handed out by the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct HandleId(u64);

struct Frame {
    root: HandleId,
    scope: UnitOfWork,
    joins: Vec<HandleId>,
}

#[derive(Default)]
pub(crate) struct ScopeStack {
    frames: Vec<Frame>,
    /// (handle, number of frames when the suppression began)
    suppressions: Vec<(HandleId, usize)>,
    next_handle: u64,
}

impl ScopeStack {
    fn next_id(&mut self) -> HandleId {
        self.next_handle += 1;
        HandleId(self.next_handle)
    }

    pub(crate) fn depth(&self) -> usize {
        self.frames.len()
    }

    /// The enlistment target: the top frame, unless a suppression sits above it
    pub(crate) fn current(&self) -> Option<UnitOfWork> {
        if self
            .suppressions
            .last()
            .is_some_and(|(_, depth)| *depth == self.frames.len())
        {
            return None;
        }
        self.frames.last().map(|f| f.scope.clone())
    }

    pub(crate) fn scopes(&self) -> Vec<UnitOfWork> {
        self.frames.iter().map(|f| f.scope.clone()).collect()
    }

    pub(crate) fn push_root(&mut self, scope: UnitOfWork) -> HandleId {
        let root = self.next_id();
        self.frames.push(Frame {
            root,
            scope,
            joins: Vec::new(),
        });
        root
    }

    /// Count a new join on the top frame. Returns `None` when there is no
    /// frame to join.
    pub(crate) fn join_top(&mut self) -> Option<HandleId> {
        let handle = self.next_id();
        let frame = self.frames.last_mut()?;
        frame.joins.push(handle);
        Some(handle)
    }

    /// Live joins on the frame pushed by `root`
    pub(crate) fn joins_on(&self, root: HandleId) -> usize {
        self.frames
            .iter()
            .find(|f| f.root == root)
            .map_or(0, |f| f.joins.len())
    }

    pub(crate) fn push_suppression(&mut self) -> HandleId {
        let handle = self.next_id();
        self.suppressions.push((handle, self.frames.len()));
        handle
    }

    fn suppressed_inside(&self, frame_index: usize) -> bool {
        self.suppressions.iter().any(|(_, depth)| *depth > frame_index)
    }

    pub(crate) fn pop_root(&mut self, handle: HandleId, scope: &ScopeId) -> Result<()> {
        let Some(idx) = self.frames.iter().position(|f| f.root == handle) else {
            return Ok(());
        };
        let above = self.frames.len() - idx - 1;
        if above > 0 {
            return Err(UowError::order_violation(
                scope.as_str(),
                format!("{above} scope(s) created inside it are still live"),
            ));
        }
        let joins = self.frames[idx].joins.len();
        if joins > 0 {
            return Err(UowError::order_violation(
                scope.as_str(),
                format!("{joins} joined handle(s) are still live"),
            ));
        }
        if self.suppressed_inside(idx) {
            return Err(UowError::order_violation(
                scope.as_str(),
                "a suppressed scope created inside it is still live",
            ));
        }
        self.frames.pop();
        Ok(())
    }

    pub(crate) fn release_join(&mut self, handle: HandleId, scope: &ScopeId) -> Result<()> {
        let Some(idx) = self.frames.iter().position(|f| f.joins.contains(&handle)) else {
            return Ok(());
        };
        if idx + 1 != self.frames.len() {
            return Err(UowError::order_violation(
                scope.as_str(),
                "a scope created inside the joined handle is still live",
            ));
        }
        if self.frames[idx].joins.last() != Some(&handle) {
            return Err(UowError::order_violation(
                scope.as_str(),
                "a later joined handle is still live",
            ));
        }
        if self.suppressed_inside(idx) {
            return Err(UowError::order_violation(
                scope.as_str(),
                "a suppressed scope created inside the joined handle is still live",
            ));
        }
        self.frames[idx].joins.pop();
        Ok(())
    }

    pub(crate) fn release_suppression(&mut self, handle: HandleId) -> Result<()> {
        let Some(pos) = self.suppressions.iter().position(|(h, _)| *h == handle) else {
            return Ok(());
        };
        if pos + 1 != self.suppressions.len() {
            return Err(UowError::order_violation(
                "suppressed scope",
                "a later suppressed scope is still live",
            ));
        }
        let depth = self.suppressions[pos].1;
        if self.frames.len() > depth {
            return Err(UowError::order_violation(
                "suppressed scope",
                "scopes created inside it are still live",
            ));
        }
        self.suppressions.pop();
        Ok(())
    }

    /// Remove every trace of a handle regardless of order. Used when a handle
    /// is dropped without being disposed.
    pub(crate) fn force_remove(&mut self, handle: HandleId) {
        self.frames.retain(|f| f.root != handle);
        for frame in &mut self.frames {
            frame.joins.retain(|h| *h != handle);
        }
        self.suppressions.retain(|(h, _)| *h != handle);
    }
}

/// One logical flow: its execution context and its scope stack.
pub struct AmbientFlow {
    execution: ExecutionContext,
    stack: Mutex<ScopeStack>,
}

impl AmbientFlow {
    pub fn new(execution: ExecutionContext) -> Arc<Self> {
        Arc::new(Self {
            execution,
            stack: Mutex::new(ScopeStack::default()),
        })
    }

    /// The flow the calling task runs in, if any
    pub fn current() -> Option<Arc<AmbientFlow>> {
        AMBIENT_FLOW.try_with(Arc::clone).ok()
    }

    /// Run `fut` with this flow as the ambient flow
    pub async fn run<F>(self: Arc<Self>, fut: F) -> F::Output
    where
        F: Future,
    {
        AMBIENT_FLOW.scope(self, fut).await
    }

    pub fn execution_context(&self) -> &ExecutionContext {
        &self.execution
    }

    /// Number of physical scopes on the stack
    pub fn depth(&self) -> usize {
        self.stack.lock().depth()
    }

    pub fn current_scope(&self) -> Option<UnitOfWork> {
        self.stack.lock().current()
    }

    pub(crate) fn stack(&self) -> MutexGuard<'_, ScopeStack> {
        self.stack.lock()
    }

    /// Another live scope in this flow that holds `key`
    pub(crate) fn key_owner(&self, key: &str, except: &ScopeId) -> Option<ScopeId> {
        let scopes = self.stack.lock().scopes();
        scopes
            .into_iter()
            .filter(|scope| scope.id() != except)
            .find(|scope| scope.holds_key(key))
            .map(|scope| scope.id().clone())
    }
}

impl std::fmt::Debug for AmbientFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmbientFlow")
            .field("execution_id", &self.execution.execution_id)
            .field("depth", &self.depth())
            .finish()
    }
}
