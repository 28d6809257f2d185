//! Error taxonomy for the propagation engine.

use std::time::Duration;

use crate::hooks::HookFailure;
use crate::transactions::Propagation;

/// Boxed, thread-safe error used for driver and callback failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the engine itself. Application errors returned by the
/// wrapped work never pass through this type unless the caller uses it as
/// its own error type.
#[derive(Debug, thiserror::Error)]
pub enum TxError {
    /// The requested propagation mode conflicts with the ambient state.
    #[error("propagation {mode:?} rejected: {reason}")]
    Propagation {
        mode: Propagation,
        reason: &'static str,
    },
    /// Setup or programming defect: unknown or duplicate data source, engine
    /// used before initialization, hook limit exceeded, frame ended twice.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// A begin, commit, rollback or savepoint statement failed in the driver.
    #[error("transactional operation failed")]
    Operation {
        #[source]
        source: BoxError,
    },
    /// Error raised by the unit of work, for callers that use `TxError` as
    /// their own error type.
    #[error("application error")]
    Application {
        #[source]
        source: BoxError,
    },
    /// One or more lifecycle callbacks failed. Every callback still ran.
    #[error("{} transaction hook(s) failed", .0.len())]
    Hooks(Vec<HookFailure>),
    /// The unit of work did not finish within the definition's timeout.
    #[error("transaction timed out after {after:?}")]
    TimedOut { after: Duration },
}

impl TxError {
    /// Wrap a driver error raised by a transactional statement.
    pub fn operation<E>(e: E) -> Self
    where
        E: Into<BoxError>,
    {
        TxError::Operation { source: e.into() }
    }

    /// Wrap an error raised by application code.
    pub fn application<E>(e: E) -> Self
    where
        E: Into<BoxError>,
    {
        TxError::Application { source: e.into() }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        TxError::Configuration(msg.into())
    }

    pub fn is_propagation(&self) -> bool {
        matches!(self, TxError::Propagation { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, TxError::Configuration(_))
    }

    pub fn is_operation(&self) -> bool {
        matches!(self, TxError::Operation { .. })
    }
}

/// Convenience alias for results returned by engine operations.
pub type TxResult<T> = Result<T, TxError>;
