#![forbid(unsafe_code)]
//! Facade crate re-exporting the `txscope` engine and its backend adapters.
//!
//! This crate provides the main public API. Add it as the single dependency of
//! your application and enable the backend features you need.
//!
//! # Example: nested scopes
//!
//! ```ignore
//! // Non-runnable: a real program registers a backend provider first, see
//! // `txscope/examples/` for runnable programs.
//! use txscope::{Propagation, TransactionDefinition, TxError};
//!
//! let engine = txscope::TransactionEngine::new(registry.clone());
//! engine.initialize(Default::default())?;
//!
//! engine
//!     .run_in_context(&TransactionDefinition::new(Propagation::Required), |ctx| async move {
//!         // `ctx.connection_as::<LibsqlConnection>()` reaches the driver.
//!         txscope::register_on_commit(|| async { Ok::<_, TxError>(()) })?;
//!         Ok::<_, TxError>(())
//!     })
//!     .await?;
//! ```
//!
//! Propagation follows the usual seven modes: `REQUIRED` joins or starts,
//! `REQUIRES_NEW` always starts a separate physical transaction, `NESTED` opens a
//! savepoint, `MANDATORY` and `NEVER` assert, `SUPPORTS` and `NOT_SUPPORTED` run
//! with or without the ambient transaction respectively.

// Re-export the whole core API.
pub use txscope_core::{
    async_trait, register_on_commit, register_on_complete, register_on_rollback, resolve,
    BoxError, Connection, ConnectionProvider, ContextStack, DataSourceRegistry, Decision,
    EngineConfig, EngineId, FrameStatus, HookErrorPolicy, HookFailure, HookKind, Isolation,
    Outcome, Propagation, TransactionContext, TransactionDefinition, TransactionEngine,
    TransactionFrame, TransactionManager, TransactionTemplate, Transactional, TxError, TxResult,
    DEFAULT_DATA_SOURCE,
};

// Module paths stay reachable for less common items (frame manager, hook lists).
pub use txscope_core::{config, context, engine, error, frame, hooks, propagation, registry, transactions};

/// Shorthand for a definition with the given propagation and defaults elsewhere.
pub fn definition(propagation: Propagation) -> TransactionDefinition {
    TransactionDefinition::new(propagation)
}

// Backend connection providers re-exported under a neutral namespace, so end-users
// don't have to depend on backend crates directly. These are feature-gated.
pub mod backends {
    #[cfg(feature = "libsql-backend")]
    pub use txscope_libsql::{LibsqlConnection, LibsqlConnectionProvider};
    #[cfg(feature = "libsql-backend")]
    pub use libsql;

    #[cfg(feature = "postgres-backend")]
    pub use txscope_tokio_postgres::{PostgresConnection, TokioPostgresConnectionProvider};
    #[cfg(feature = "postgres-backend")]
    pub use tokio_postgres;
}
