//! Engine configuration.

use crate::error::{TxError, TxResult};
use crate::hooks::HookErrorPolicy;

/// Settings passed to [`crate::TransactionEngine::initialize`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    /// Maximum callbacks of one kind (commit, rollback, complete) per frame.
    pub max_hook_handlers: usize,
    pub hook_error_policy: HookErrorPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_hook_handlers: 10,
            hook_error_policy: HookErrorPolicy::Raise,
        }
    }
}

impl EngineConfig {
    pub fn with_max_hook_handlers(mut self, max: usize) -> Self {
        self.max_hook_handlers = max;
        self
    }

    pub fn with_hook_error_policy(mut self, policy: HookErrorPolicy) -> Self {
        self.hook_error_policy = policy;
        self
    }

    pub(crate) fn validate(&self) -> TxResult<()> {
        if self.max_hook_handlers == 0 {
            return Err(TxError::configuration(
                "max_hook_handlers must be at least 1",
            ));
        }
        Ok(())
    }
}
