#![forbid(unsafe_code)]
//! Core of the txscope transactional engine.
//!
//! Application code runs units of work through a [`TransactionEngine`] (or the
//! [`TransactionManager`] trait it implements). The engine resolves the requested
//! [`Propagation`] against the frames already active in the calling task, opens a
//! transaction or savepoint when required, and commits or rolls back when the work
//! finishes. Code running inside a scope can register lifecycle callbacks with
//! [`register_on_commit`], [`register_on_rollback`] and [`register_on_complete`]
//! without holding any handle.
//!
//! This crate is database-agnostic. Backends implement [`Connection`] and
//! [`ConnectionProvider`] in their own crates.

// Re-export so backend crates can implement the connection traits without a direct dependency.
pub use async_trait::async_trait;

pub mod config;
pub mod connection;
pub mod context;
pub mod engine;
pub mod error;
pub mod frame;
pub mod hooks;
mod obs;
pub mod propagation;
pub mod registry;
pub mod transactions;

pub use config::EngineConfig;
pub use connection::{Connection, ConnectionProvider};
pub use context::ContextStack;
pub use engine::{EngineId, TransactionEngine};
pub use error::{BoxError, TxError, TxResult};
pub use frame::{FrameStatus, TransactionFrame};
pub use hooks::{
    register_on_commit, register_on_complete, register_on_rollback, HookErrorPolicy, HookFailure,
    HookKind,
};
pub use propagation::{resolve, Decision};
pub use registry::DataSourceRegistry;
pub use transactions::{
    Isolation, Outcome, Propagation, TransactionContext, TransactionDefinition,
    TransactionManager, TransactionTemplate, Transactional, DEFAULT_DATA_SOURCE,
};
