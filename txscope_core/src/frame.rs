//! Transaction frames and their lifecycle.
//!
//! A frame is one transactional scope: either a top-level physical transaction
//! (depth 0) or a savepoint inside one. Only the scope that opened a frame may end
//! it; scopes that joined it hold a participant handle whose `end` is a no-op.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::connection::Connection;
use crate::engine::EngineId;
use crate::error::{TxError, TxResult};
use crate::hooks::{self, Hook, HookErrorPolicy, HookKind, HookLists};
use crate::obs;
use crate::propagation::Decision;
use crate::registry::DataSourceRegistry;
use crate::transactions::{Isolation, Outcome, TransactionDefinition};

/// Lifecycle state of a frame. `Committed` and `RolledBack` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Active,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
}

impl FrameStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameStatus::Committed | FrameStatus::RolledBack)
    }
}

/// State shared by a top-level frame and every savepoint frame nested in it.
struct PhysicalTransaction {
    connection: Mutex<Option<Arc<dyn Connection>>>,
    isolation: Isolation,
    savepoints: AtomicUsize,
    // Outermost savepoint abandoned by a cancelled scope. Blocks the commit until
    // it or an enclosing savepoint is rolled back.
    poisoned: Mutex<Option<Savepoint>>,
}

#[derive(Debug, Clone)]
struct Savepoint {
    seq: usize,
    name: String,
}

impl PhysicalTransaction {
    fn new(connection: Option<Arc<dyn Connection>>, isolation: Isolation) -> Self {
        Self {
            connection: Mutex::new(connection),
            isolation,
            savepoints: AtomicUsize::new(0),
            poisoned: Mutex::new(None),
        }
    }

    fn connection(&self) -> TxResult<Arc<dyn Connection>> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| TxError::configuration("transaction connection already released"))
    }

    fn release(&self) -> Option<Arc<dyn Connection>> {
        self.connection.lock().take()
    }

    fn next_savepoint(&self) -> Savepoint {
        let seq = self.savepoints.fetch_add(1, Ordering::SeqCst) + 1;
        Savepoint {
            seq,
            name: format!("sp_{}", seq),
        }
    }

    fn poison(&self, savepoint: &Savepoint) {
        let mut poisoned = self.poisoned.lock();
        match poisoned.as_ref() {
            Some(current) if current.seq <= savepoint.seq => {}
            _ => *poisoned = Some(savepoint.clone()),
        }
    }

    // Savepoints nest, so every savepoint opened after `savepoint` and still
    // pending was discarded by rolling back to it.
    fn clear_poison_from(&self, savepoint: &Savepoint) {
        let mut poisoned = self.poisoned.lock();
        if poisoned.as_ref().map_or(false, |p| p.seq >= savepoint.seq) {
            *poisoned = None;
        }
    }

    fn take_poison(&self) -> Option<String> {
        self.poisoned.lock().take().map(|p| p.name)
    }
}

struct FrameState {
    status: FrameStatus,
    hooks: HookLists,
}

/// One transactional scope bound to a data source.
pub struct TransactionFrame {
    id: Ulid,
    engine: EngineId,
    data_source: String,
    depth: usize,
    savepoint: Option<Savepoint>,
    physical: Arc<PhysicalTransaction>,
    max_hooks: usize,
    rollback_only: AtomicBool,
    started: Instant,
    state: Mutex<FrameState>,
}

impl TransactionFrame {
    fn new(
        engine: EngineId,
        data_source: &str,
        depth: usize,
        savepoint: Option<Savepoint>,
        physical: Arc<PhysicalTransaction>,
        max_hooks: usize,
    ) -> Self {
        Self {
            id: Ulid::new(),
            engine,
            data_source: data_source.to_string(),
            depth,
            savepoint,
            physical,
            max_hooks,
            rollback_only: AtomicBool::new(false),
            started: Instant::now(),
            state: Mutex::new(FrameState {
                status: FrameStatus::Active,
                hooks: HookLists::default(),
            }),
        }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }

    pub(crate) fn engine_id(&self) -> EngineId {
        self.engine
    }

    pub fn data_source(&self) -> &str {
        &self.data_source
    }

    /// 0 for a top-level transaction, greater for savepoints.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn savepoint(&self) -> Option<&str> {
        self.savepoint.as_ref().map(|s| s.name.as_str())
    }

    /// Level the physical transaction was opened with; nested frames report their
    /// root's level.
    pub fn isolation(&self) -> Isolation {
        self.physical.isolation
    }

    /// The connection, until the top-level frame terminates and releases it.
    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.physical.connection.lock().clone()
    }

    pub fn status(&self) -> FrameStatus {
        self.state.lock().status
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    pub fn set_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::SeqCst);
    }

    pub fn hook_count(&self, kind: HookKind) -> usize {
        self.state.lock().hooks.len(kind)
    }

    pub(crate) fn started(&self) -> Instant {
        self.started
    }

    pub(crate) fn add_hook(&self, kind: HookKind, hook: Hook) -> TxResult<()> {
        let mut state = self.state.lock();
        if state.status != FrameStatus::Active {
            return Err(TxError::configuration(format!(
                "cannot register a hook on frame {} in status {:?}",
                self.id, state.status
            )));
        }
        state.hooks.push(kind, hook, self.max_hooks)
    }

    fn start_ending(&self, next: FrameStatus) -> TxResult<()> {
        let mut state = self.state.lock();
        if state.status != FrameStatus::Active {
            return Err(TxError::configuration(format!(
                "transaction frame {} already ended ({:?})",
                self.id, state.status
            )));
        }
        state.status = next;
        Ok(())
    }

    fn set_status(&self, status: FrameStatus) {
        self.state.lock().status = status;
    }

    fn take_hooks(&self) -> HookLists {
        std::mem::take(&mut self.state.lock().hooks)
    }
}

impl std::fmt::Debug for TransactionFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionFrame")
            .field("id", &self.id)
            .field("data_source", &self.data_source)
            .field("depth", &self.depth)
            .field("savepoint", &self.savepoint())
            .field("status", &self.status())
            .finish()
    }
}

/// A scope's grip on a frame: owners end it, participants only use it.
#[derive(Debug, Clone)]
pub struct FrameHandle {
    frame: Arc<TransactionFrame>,
    owner: bool,
}

impl FrameHandle {
    pub fn frame(&self) -> &Arc<TransactionFrame> {
        &self.frame
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

/// Opens and terminates frames against the registry's connections.
pub struct FrameManager {
    engine: EngineId,
    registry: Arc<DataSourceRegistry>,
    config: EngineConfig,
}

impl FrameManager {
    pub fn new(engine: EngineId, registry: Arc<DataSourceRegistry>, config: EngineConfig) -> Self {
        Self {
            engine,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Apply a decision from [`crate::propagation::resolve`]. `data_source` is the
    /// canonical registry name.
    pub async fn begin(
        &self,
        decision: Decision,
        def: &TransactionDefinition,
        data_source: &str,
    ) -> TxResult<FrameHandle> {
        let label = decision.label();
        match decision {
            Decision::Reuse(frame) => {
                if def.isolation != Isolation::Default && def.isolation != frame.isolation() {
                    tracing::debug!(
                        frame = %frame.id(),
                        requested = ?def.isolation,
                        ambient = ?frame.isolation(),
                        "isolation level ignored for joined transaction"
                    );
                }
                Ok(FrameHandle {
                    frame,
                    owner: false,
                })
            }
            Decision::StartNew => {
                let provider = self.registry.get(data_source)?;
                let connection = provider.acquire().await?;
                connection.begin(def).await?;
                let physical = Arc::new(PhysicalTransaction::new(Some(connection), def.isolation));
                let frame = TransactionFrame::new(
                    self.engine,
                    data_source,
                    0,
                    None,
                    physical,
                    self.config.max_hook_handlers,
                );
                obs::frame_begun(&frame, label);
                Ok(FrameHandle {
                    frame: Arc::new(frame),
                    owner: true,
                })
            }
            Decision::StartNested(parent) => {
                if def.isolation != Isolation::Default && def.isolation != parent.isolation() {
                    tracing::debug!(
                        parent = %parent.id(),
                        requested = ?def.isolation,
                        "isolation level ignored for savepoint"
                    );
                }
                let physical = parent.physical.clone();
                let connection = physical.connection()?;
                let savepoint = physical.next_savepoint();
                connection.savepoint(&savepoint.name).await?;
                let frame = TransactionFrame::new(
                    self.engine,
                    parent.data_source(),
                    parent.depth() + 1,
                    Some(savepoint),
                    physical,
                    self.config.max_hook_handlers,
                );
                obs::frame_begun(&frame, label);
                Ok(FrameHandle {
                    frame: Arc::new(frame),
                    owner: true,
                })
            }
            other => Err(TxError::configuration(format!(
                "decision `{}` does not open a frame",
                other.label()
            ))),
        }
    }

    /// Commit or roll back an owned frame and fire its hooks. Participant handles
    /// are ignored. Ending a frame that is no longer active is rejected.
    pub async fn end(&self, handle: &FrameHandle, outcome: Outcome) -> TxResult<()> {
        if !handle.owner {
            return Ok(());
        }
        let frame = &handle.frame;
        // Rollback-only frames roll back quietly: the caller still gets Ok.
        let outcome = if outcome == Outcome::Commit && frame.is_rollback_only() {
            Outcome::Rollback
        } else {
            outcome
        };

        match outcome {
            Outcome::Commit => {
                frame.start_ending(FrameStatus::Committing)?;
                match self.commit_physical(frame).await {
                    Ok(()) => {
                        frame.set_status(FrameStatus::Committed);
                        self.finish(frame, Outcome::Commit, None).await
                    }
                    Err(err) => {
                        frame.set_status(FrameStatus::RollingBack);
                        if let Err(e) = self.rollback_physical(frame).await {
                            tracing::error!(
                                frame = %frame.id(),
                                error = %e,
                                "compensating rollback after failed commit also failed"
                            );
                        }
                        frame.set_status(FrameStatus::RolledBack);
                        self.finish(frame, Outcome::Rollback, Some(err)).await
                    }
                }
            }
            Outcome::Rollback => {
                frame.start_ending(FrameStatus::RollingBack)?;
                let res = self.rollback_physical(frame).await;
                frame.set_status(FrameStatus::RolledBack);
                self.finish(frame, Outcome::Rollback, res.err()).await
            }
        }
    }

    /// Called when a scope is dropped before its frame ended. Treated as a
    /// rollback: top-level frames roll back on a spawned task, savepoint frames
    /// poison their physical transaction until it or an enclosing savepoint is
    /// rolled back. Outside a tokio runtime the rollback hooks run inline on the
    /// dropping thread.
    pub fn abandon(self: &Arc<Self>, handle: &FrameHandle) {
        if !handle.owner {
            return;
        }
        let frame = handle.frame.clone();
        let prior = frame.status();
        if prior.is_terminal() {
            return;
        }
        frame.set_status(FrameStatus::RollingBack);
        tracing::warn!(
            frame = %frame.id(),
            data_source = frame.data_source(),
            depth = frame.depth(),
            status = ?prior,
            "transaction scope dropped before completion, rolling back"
        );
        if let Some(savepoint) = &frame.savepoint {
            frame.physical.poison(savepoint);
        }

        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let manager = self.clone();
                rt.spawn(async move {
                    let res = if frame.depth() == 0 {
                        manager.rollback_physical(&frame).await
                    } else {
                        Ok(())
                    };
                    frame.set_status(FrameStatus::RolledBack);
                    if let Err(e) = manager.finish(&frame, Outcome::Rollback, res.err()).await {
                        tracing::warn!(frame = %frame.id(), error = %e, "abandoned transaction cleanup failed");
                    }
                });
            }
            Err(_) => {
                // Without a runtime the driver cannot roll back; dropping the
                // connection discards the open transaction.
                frame.set_status(FrameStatus::RolledBack);
                tracing::warn!(
                    frame = %frame.id(),
                    "no async runtime available, releasing the connection without ROLLBACK"
                );
                if let Err(e) = futures::executor::block_on(self.finish(&frame, Outcome::Rollback, None)) {
                    tracing::warn!(frame = %frame.id(), error = %e, "abandoned transaction cleanup failed");
                }
            }
        }
    }

    async fn commit_physical(&self, frame: &TransactionFrame) -> TxResult<()> {
        let connection = frame.physical.connection()?;
        match frame.savepoint() {
            None => {
                if let Some(savepoint) = frame.physical.take_poison() {
                    return Err(TxError::operation(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!(
                            "savepoint {} was abandoned by a cancelled scope, transaction cannot commit",
                            savepoint
                        ),
                    )));
                }
                connection.commit().await
            }
            Some(name) => connection.release_savepoint(name).await,
        }
    }

    async fn rollback_physical(&self, frame: &TransactionFrame) -> TxResult<()> {
        let connection = frame.physical.connection()?;
        match &frame.savepoint {
            None => connection.rollback().await,
            Some(savepoint) => {
                connection.rollback_to_savepoint(&savepoint.name).await?;
                frame.physical.clear_poison_from(savepoint);
                Ok(())
            }
        }
    }

    /// Release the connection of a top-level frame, then fire hooks. `error` is the
    /// frame's own failure; it always wins over hook failures.
    async fn finish(
        &self,
        frame: &TransactionFrame,
        outcome: Outcome,
        error: Option<TxError>,
    ) -> TxResult<()> {
        if frame.depth() == 0 {
            drop(frame.physical.release());
        }
        let failures = hooks::dispatch(frame.take_hooks(), outcome).await;
        obs::frame_ended(frame, outcome, error.is_none());
        if !failures.is_empty() {
            obs::hook_failures(frame, failures.len());
        }

        let raise = error.is_none() && self.config.hook_error_policy == HookErrorPolicy::Raise;
        if raise && !failures.is_empty() {
            return Err(TxError::Hooks(failures));
        }
        for failure in &failures {
            tracing::warn!(frame = %frame.id(), failure = %failure, "transaction hook failed");
        }
        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for FrameManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameManager")
            .field("engine", &self.engine)
            .field("config", &self.config)
            .finish()
    }
}

/// Detached top-level frame without a connection, for tests of the pure modules.
#[cfg(test)]
pub(crate) fn test_frame(engine: EngineId, data_source: &str, depth: usize) -> Arc<TransactionFrame> {
    let physical = Arc::new(PhysicalTransaction::new(None, Isolation::Default));
    let savepoint = if depth > 0 {
        Some(physical.next_savepoint())
    } else {
        None
    };
    Arc::new(TransactionFrame::new(
        engine,
        data_source,
        depth,
        savepoint,
        physical,
        10,
    ))
}
