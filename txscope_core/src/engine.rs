//! The engine entry point: resolve propagation, open or join a frame, run the work
//! with the frame installed in the task's context, then commit or roll back.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::EngineConfig;
use crate::context::ContextStack;
use crate::error::{TxError, TxResult};
use crate::frame::{FrameHandle, FrameManager, TransactionFrame};
use crate::propagation::{self, Decision};
use crate::registry::DataSourceRegistry;
use crate::transactions::{
    Outcome, TransactionContext, TransactionDefinition, TransactionManager, TransactionTemplate,
    Transactional,
};

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

/// Distinguishes frames of independent engines sharing one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineId(u64);

impl EngineId {
    /// A process-unique id, for building a [`FrameManager`] outside an engine.
    pub fn next() -> Self {
        EngineId(NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Rolls back the frame if the scope is dropped before it could end the frame.
struct FrameGuard {
    manager: Arc<FrameManager>,
    handle: FrameHandle,
    armed: bool,
}

impl FrameGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FrameGuard {
    fn drop(&mut self) {
        if self.armed {
            self.manager.abandon(&self.handle);
        }
    }
}

/// Coordinates transactional scopes over the data sources of one registry.
///
/// The engine must be [initialized](Self::initialize) before use and can be
/// [shut down](Self::shutdown) and re-initialized; several engines may coexist in
/// one process.
pub struct TransactionEngine {
    id: EngineId,
    registry: Arc<DataSourceRegistry>,
    frames: RwLock<Option<Arc<FrameManager>>>,
}

impl TransactionEngine {
    pub fn new(registry: Arc<DataSourceRegistry>) -> Self {
        Self {
            id: EngineId::next(),
            registry,
            frames: RwLock::new(None),
        }
    }

    pub fn id(&self) -> EngineId {
        self.id
    }

    pub fn registry(&self) -> &Arc<DataSourceRegistry> {
        &self.registry
    }

    pub fn initialize(&self, config: EngineConfig) -> TxResult<()> {
        config.validate()?;
        let mut frames = self.frames.write();
        if frames.is_some() {
            return Err(TxError::configuration("transaction engine already initialized"));
        }
        tracing::info!(
            max_hook_handlers = config.max_hook_handlers,
            hook_error_policy = ?config.hook_error_policy,
            data_sources = self.registry.len(),
            "transaction engine initialized"
        );
        *frames = Some(Arc::new(FrameManager::new(
            self.id,
            self.registry.clone(),
            config,
        )));
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.frames.read().is_some()
    }

    pub fn config(&self) -> Option<EngineConfig> {
        self.frames.read().as_ref().map(|m| m.config().clone())
    }

    /// Unregister every data source and return to the uninitialized state. Scopes
    /// already running keep the manager they started with.
    pub fn shutdown(&self) {
        self.registry.unregister_all();
        if self.frames.write().take().is_some() {
            tracing::info!("transaction engine shut down");
        }
    }

    fn frames(&self) -> TxResult<Arc<FrameManager>> {
        self.frames.read().clone().ok_or_else(|| {
            TxError::configuration("transaction engine used before initialize()")
        })
    }

    /// The calling task's active frame for `data_source` on this engine.
    pub fn current_frame(&self, data_source: &str) -> Option<Arc<TransactionFrame>> {
        ContextStack::current()
            .current_for(self.id, data_source)
            .cloned()
    }

    /// Run `work` according to `def`.
    ///
    /// Errors returned by `work` come back unchanged after the owned frame has been
    /// rolled back. Engine failures (propagation conflicts, configuration defects,
    /// failed commits, hook failures, timeouts) are converted with `E::from`.
    pub async fn run_in_context<R, E, F, Fut>(&self, def: &TransactionDefinition, work: F) -> Result<R, E>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<TxError>,
    {
        let frames = self.frames()?;
        let (data_source, _) = self.registry.resolve(def.data_source_name())?;
        let stack = ContextStack::current();
        let current = stack.current_for(self.id, &data_source).cloned();

        match propagation::resolve(def.propagation, current.as_ref()) {
            Decision::Fail { mode, reason } => {
                tracing::debug!(data_source = %data_source, mode = ?mode, reason, "propagation rejected");
                Err(TxError::Propagation { mode, reason }.into())
            }
            Decision::RunPlain => work(TransactionContext::plain()).await,
            Decision::SuspendAndRunPlain(suspended) => {
                tracing::debug!(frame = %suspended.id(), data_source = %data_source, "transaction suspended");
                stack
                    .without(self.id, &data_source)
                    .scope(async move { work(TransactionContext::plain()).await })
                    .await
            }
            decision => {
                let handle = frames.begin(decision, def, &data_source).await?;
                let frame = handle.frame().clone();
                let owner = handle.is_owner();
                let mut guard = FrameGuard {
                    manager: frames.clone(),
                    handle,
                    armed: true,
                };

                let ctx = TransactionContext::in_frame(frame.clone(), owner);
                let scoped = stack
                    .pushed(frame)
                    .scope(async move { work(ctx).await });
                let result = match def.timeout.filter(|_| owner) {
                    Some(after) => match tokio::time::timeout(after, scoped).await {
                        Ok(result) => result,
                        Err(_) => {
                            if let Err(e) = frames.end(&guard.handle, Outcome::Rollback).await {
                                tracing::warn!(error = %e, "rollback after timeout failed");
                            }
                            guard.disarm();
                            return Err(TxError::TimedOut { after }.into());
                        }
                    },
                    None => scoped.await,
                };

                match result {
                    Ok(value) => {
                        let ended = frames.end(&guard.handle, Outcome::Commit).await;
                        guard.disarm();
                        ended?;
                        Ok(value)
                    }
                    Err(app_err) => {
                        if let Err(e) = frames.end(&guard.handle, Outcome::Rollback).await {
                            tracing::error!(
                                frame = %guard.handle.frame().id(),
                                error = %e,
                                "rollback after application error failed"
                            );
                        }
                        guard.disarm();
                        Err(app_err)
                    }
                }
            }
        }
    }

    /// Template bound to this engine with default definition.
    pub fn template(self: &Arc<Self>) -> TransactionTemplate<Arc<TransactionEngine>> {
        TransactionTemplate::new(self.clone())
    }

    /// Wrapper factory for decorator-style use.
    pub fn transactional(self: &Arc<Self>, def: TransactionDefinition) -> Transactional<TransactionEngine> {
        Transactional::new(self.clone(), def)
    }
}

#[async_trait::async_trait]
impl TransactionManager for TransactionEngine {
    async fn execute<'a, R, E, F, Fut>(&'a self, def: &TransactionDefinition, f: F) -> Result<R, E>
    where
        F: FnOnce(TransactionContext) -> Fut + Send + 'a,
        Fut: Future<Output = Result<R, E>> + Send + 'a,
        R: Send + 'a,
        E: From<TxError> + Send + 'a,
    {
        self.run_in_context(def, f).await
    }
}

impl std::fmt::Debug for TransactionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionEngine")
            .field("id", &self.id)
            .field("registry", &self.registry)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
