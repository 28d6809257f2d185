//! The seam between the engine and database drivers.
//!
//! A backend implements [`ConnectionProvider`] to hand out physical connections and
//! [`Connection`] to translate the six transactional primitives into driver calls.
//! Connections are released by dropping them; the engine drops its reference as soon
//! as the owning frame terminates.

use std::any::Any;
use std::sync::Arc;

use crate::error::TxResult;
use crate::transactions::TransactionDefinition;

#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Open a physical transaction honoring the definition's isolation,
    /// read-only flag and timeout where the backend supports them.
    async fn begin(&self, def: &TransactionDefinition) -> TxResult<()>;

    async fn commit(&self) -> TxResult<()>;

    async fn rollback(&self) -> TxResult<()>;

    async fn savepoint(&self, name: &str) -> TxResult<()>;

    async fn release_savepoint(&self, name: &str) -> TxResult<()>;

    async fn rollback_to_savepoint(&self, name: &str) -> TxResult<()>;

    /// Upcast used by [`crate::TransactionContext::connection_as`].
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Capability to obtain a new physical connection.
#[async_trait::async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn acquire(&self) -> TxResult<Arc<dyn Connection>>;
}
