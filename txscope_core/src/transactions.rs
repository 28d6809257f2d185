//! Backend-agnostic transaction definitions modeled after Spring's TransactionTemplate.
//! The engine in [`crate::engine`] implements [`TransactionManager`]; backends only
//! provide connections.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::connection::Connection;
use crate::error::TxError;
use crate::frame::TransactionFrame;

/// Transaction propagation behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum Propagation {
    #[default]
    Required,
    RequiresNew,
    Nested,
    Mandatory,
    Never,
    NotSupported,
    Supports,
}

/// Transaction isolation level (best-effort across backends).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum Isolation {
    /// Leave the backend's default level in place.
    #[default]
    Default,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    /// SQL name of the level, `None` for [`Isolation::Default`].
    pub fn as_sql(&self) -> Option<&'static str> {
        match self {
            Isolation::Default => None,
            Isolation::ReadUncommitted => Some("READ UNCOMMITTED"),
            Isolation::ReadCommitted => Some("READ COMMITTED"),
            Isolation::RepeatableRead => Some("REPEATABLE READ"),
            Isolation::Serializable => Some("SERIALIZABLE"),
        }
    }
}

/// Name of the unnamed (primary) data source.
pub const DEFAULT_DATA_SOURCE: &str = "";

/// Transaction definition describing desired semantics.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionDefinition {
    pub propagation: Propagation,
    /// Only honored when a new physical transaction is opened.
    pub isolation: Isolation,
    /// `None` selects the default data source.
    pub data_source: Option<String>,
    pub read_only: bool,
    pub timeout: Option<Duration>,
}

impl TransactionDefinition {
    pub fn new(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Self::default()
        }
    }

    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_data_source(mut self, name: impl Into<String>) -> Self {
        self.data_source = Some(name.into());
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The data source this definition targets, with the default sentinel applied.
    pub fn data_source_name(&self) -> &str {
        self.data_source.as_deref().unwrap_or(DEFAULT_DATA_SOURCE)
    }
}

/// Final outcome requested for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Commit,
    Rollback,
}

/// Handle passed to the unit of work. It describes the frame the work runs in,
/// if any, and gives access to the frame's connection.
#[derive(Clone, Default)]
pub struct TransactionContext {
    frame: Option<Arc<TransactionFrame>>,
    new: bool,
}

impl TransactionContext {
    /// Context for work running outside any transaction.
    pub fn plain() -> Self {
        Self::default()
    }

    pub(crate) fn in_frame(frame: Arc<TransactionFrame>, is_new: bool) -> Self {
        Self {
            frame: Some(frame),
            new: is_new,
        }
    }

    pub fn is_transactional(&self) -> bool {
        self.frame.is_some()
    }

    /// True when this scope opened the frame (a new transaction or savepoint)
    /// rather than joining an existing one.
    pub fn is_new_transaction(&self) -> bool {
        self.new
    }

    pub fn frame(&self) -> Option<&Arc<TransactionFrame>> {
        self.frame.as_ref()
    }

    pub fn depth(&self) -> Option<usize> {
        self.frame.as_ref().map(|f| f.depth())
    }

    pub fn savepoint(&self) -> Option<&str> {
        self.frame.as_ref().and_then(|f| f.savepoint())
    }

    pub fn data_source(&self) -> Option<&str> {
        self.frame.as_ref().map(|f| f.data_source())
    }

    pub fn isolation(&self) -> Option<Isolation> {
        self.frame.as_ref().map(|f| f.isolation())
    }

    pub fn connection(&self) -> Option<Arc<dyn Connection>> {
        self.frame.as_ref().and_then(|f| f.connection())
    }

    /// The frame's connection downcast to the backend's concrete type.
    pub fn connection_as<C: Connection>(&self) -> Option<Arc<C>> {
        let conn = self.connection()?;
        let any: Arc<dyn Any + Send + Sync> = conn.into_any();
        any.downcast::<C>().ok()
    }

    /// Make the owning frame roll back instead of committing. The work's
    /// value is still returned to the caller. No-op outside a transaction.
    pub fn set_rollback_only(&self) {
        if let Some(frame) = &self.frame {
            frame.set_rollback_only();
        }
    }

    pub fn is_rollback_only(&self) -> bool {
        self.frame
            .as_ref()
            .map(|f| f.is_rollback_only())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("frame", &self.frame.as_ref().map(|fr| fr.id()))
            .field("new", &self.new)
            .finish()
    }
}

/// Runs units of work inside transactional scopes.
#[async_trait::async_trait]
pub trait TransactionManager: Send + Sync {
    /// Execute the provided async callback within a transactional scope according to
    /// the given definition. Implementations must ensure commit/rollback as appropriate
    /// and return errors raised by the callback unchanged.
    async fn execute<'a, R, E, F, Fut>(&'a self, def: &TransactionDefinition, f: F) -> Result<R, E>
    where
        F: FnOnce(TransactionContext) -> Fut + Send + 'a,
        Fut: Future<Output = Result<R, E>> + Send + 'a,
        R: Send + 'a,
        E: From<TxError> + Send + 'a;
}

#[async_trait::async_trait]
impl<M> TransactionManager for Arc<M>
where
    M: TransactionManager,
{
    async fn execute<'a, R, E, F, Fut>(&'a self, def: &TransactionDefinition, f: F) -> Result<R, E>
    where
        F: FnOnce(TransactionContext) -> Fut + Send + 'a,
        Fut: Future<Output = Result<R, E>> + Send + 'a,
        R: Send + 'a,
        E: From<TxError> + Send + 'a,
    {
        (**self).execute(def, f).await
    }
}

/// Convenience wrapper similar to Spring's TransactionTemplate.
#[derive(Debug, Clone)]
pub struct TransactionTemplate<M: TransactionManager> {
    manager: M,
    defaults: TransactionDefinition,
}

impl<M: TransactionManager> TransactionTemplate<M> {
    pub fn new(manager: M) -> Self {
        Self {
            manager,
            defaults: TransactionDefinition::default(),
        }
    }

    pub fn with_defaults(mut self, def: TransactionDefinition) -> Self {
        self.defaults = def;
        self
    }

    pub fn defaults(&self) -> &TransactionDefinition {
        &self.defaults
    }

    pub async fn execute<R, E, F, Fut>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(TransactionContext) -> Fut + Send,
        Fut: Future<Output = Result<R, E>> + Send,
        R: Send,
        E: From<TxError> + Send,
    {
        self.manager.execute(&self.defaults, f).await
    }

    pub async fn execute_with<R, E, F, Fut>(
        &self,
        def: &TransactionDefinition,
        f: F,
    ) -> Result<R, E>
    where
        F: FnOnce(TransactionContext) -> Fut + Send,
        Fut: Future<Output = Result<R, E>> + Send,
        R: Send,
        E: From<TxError> + Send,
    {
        self.manager.execute(def, f).await
    }
}

/// Higher-order wrapper used by decorator-style facilities: turns a plain async
/// function into one that always runs through the manager with a fixed definition.
#[derive(Debug, Clone)]
pub struct Transactional<M> {
    manager: Arc<M>,
    def: TransactionDefinition,
}

impl<M> Transactional<M>
where
    M: TransactionManager + 'static,
{
    pub fn new(manager: Arc<M>, def: TransactionDefinition) -> Self {
        Self { manager, def }
    }

    /// Wrap `f` so that every call runs inside a transactional scope.
    pub fn wrap<A, R, E, F, Fut>(self, f: F) -> impl Fn(A) -> BoxFuture<'static, Result<R, E>>
    where
        A: Send + 'static,
        F: Fn(TransactionContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        R: Send + 'static,
        E: From<TxError> + Send + 'static,
    {
        let f = Arc::new(f);
        move |arg: A| {
            let manager = self.manager.clone();
            let def = self.def.clone();
            let f = f.clone();
            Box::pin(async move { manager.execute(&def, move |ctx| f(ctx, arg)).await })
        }
    }
}
