//! Per-task context carrier.
//!
//! The stack of active frames is an immutable snapshot stored in a tokio task-local.
//! Every transactional scope runs its work inside a child scope holding a new
//! snapshot, so the previous stack comes back exactly when the work completes or is
//! dropped, and concurrent tasks never observe each other's frames. The carrier holds
//! data only; all propagation decisions live in [`crate::propagation`].

use std::future::Future;
use std::sync::Arc;

use crate::engine::EngineId;
use crate::frame::TransactionFrame;

tokio::task_local! {
    static CONTEXT: ContextStack;
}

/// Ordered frames visible to the current logical task, outermost first.
#[derive(Clone, Default)]
pub struct ContextStack {
    frames: Vec<Arc<TransactionFrame>>,
}

impl ContextStack {
    /// Snapshot of the calling task's stack; empty outside any transactional scope.
    pub fn current() -> Self {
        CONTEXT.try_with(|stack| stack.clone()).unwrap_or_default()
    }

    pub fn top(&self) -> Option<&Arc<TransactionFrame>> {
        self.frames.last()
    }

    /// Top-most frame bound to `data_source` on the given engine.
    pub fn current_for(&self, engine: EngineId, data_source: &str) -> Option<&Arc<TransactionFrame>> {
        self.frames
            .iter()
            .rev()
            .find(|f| f.engine_id() == engine && f.data_source() == data_source)
    }

    pub fn pushed(&self, frame: Arc<TransactionFrame>) -> Self {
        let mut frames = self.frames.clone();
        frames.push(frame);
        Self { frames }
    }

    /// The stack with every frame of `data_source` on `engine` removed, used while a
    /// transaction is suspended.
    pub fn without(&self, engine: EngineId, data_source: &str) -> Self {
        let frames = self
            .frames
            .iter()
            .filter(|f| !(f.engine_id() == engine && f.data_source() == data_source))
            .cloned()
            .collect();
        Self { frames }
    }

    pub fn frames(&self) -> impl Iterator<Item = &Arc<TransactionFrame>> {
        self.frames.iter()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Run `fut` with this stack installed as the task's context.
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CONTEXT.scope(self, fut).await
    }
}

impl std::fmt::Debug for ContextStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.frames.iter().map(|fr| (fr.data_source(), fr.depth(), fr.id())))
            .finish()
    }
}
