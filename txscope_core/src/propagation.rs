//! Propagation rules: what a scope does given the ambient frame.

use std::sync::Arc;

use crate::error::TxError;
use crate::frame::TransactionFrame;
use crate::transactions::Propagation;

/// Result of applying a propagation mode to the ambient frame.
#[derive(Debug, Clone)]
pub enum Decision {
    /// Join the ambient frame; its owner commits or rolls back.
    Reuse(Arc<TransactionFrame>),
    /// Open a new physical transaction. Any ambient frame stays below it untouched.
    StartNew,
    /// Open a savepoint inside the parent's physical transaction.
    StartNested(Arc<TransactionFrame>),
    /// Hide the ambient frame from the work, then restore it.
    SuspendAndRunPlain(Arc<TransactionFrame>),
    /// No ambient frame and none wanted.
    RunPlain,
    Fail {
        mode: Propagation,
        reason: &'static str,
    },
}

impl Decision {
    pub fn opens_frame(&self) -> bool {
        matches!(self, Decision::StartNew | Decision::StartNested(_))
    }

    pub fn into_error(self) -> Option<TxError> {
        match self {
            Decision::Fail { mode, reason } => Some(TxError::Propagation { mode, reason }),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Decision::Reuse(_) => "reuse",
            Decision::StartNew => "start_new",
            Decision::StartNested(_) => "start_nested",
            Decision::SuspendAndRunPlain(_) => "suspend",
            Decision::RunPlain => "plain",
            Decision::Fail { .. } => "fail",
        }
    }
}

/// Decide how a scope with `mode` relates to `current`, the top-most frame already
/// bound to the target data source.
pub fn resolve(mode: Propagation, current: Option<&Arc<TransactionFrame>>) -> Decision {
    match (mode, current) {
        (Propagation::Required, None) => Decision::StartNew,
        (Propagation::Required, Some(f)) => Decision::Reuse(f.clone()),
        (Propagation::RequiresNew, _) => Decision::StartNew,
        (Propagation::Nested, None) => Decision::StartNew,
        (Propagation::Nested, Some(f)) => Decision::StartNested(f.clone()),
        (Propagation::Mandatory, None) => Decision::Fail {
            mode,
            reason: "no transaction active",
        },
        (Propagation::Mandatory, Some(f)) => Decision::Reuse(f.clone()),
        (Propagation::Never, None) => Decision::RunPlain,
        (Propagation::Never, Some(_)) => Decision::Fail {
            mode,
            reason: "transaction active but NEVER requested",
        },
        (Propagation::NotSupported, None) => Decision::RunPlain,
        (Propagation::NotSupported, Some(f)) => Decision::SuspendAndRunPlain(f.clone()),
        (Propagation::Supports, None) => Decision::RunPlain,
        (Propagation::Supports, Some(f)) => Decision::Reuse(f.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineId;
    use crate::frame::test_frame;

    #[test]
    fn without_ambient_frame() {
        use Propagation::*;
        assert!(matches!(resolve(Required, None), Decision::StartNew));
        assert!(matches!(resolve(RequiresNew, None), Decision::StartNew));
        assert!(matches!(resolve(Nested, None), Decision::StartNew));
        assert!(matches!(resolve(Never, None), Decision::RunPlain));
        assert!(matches!(resolve(NotSupported, None), Decision::RunPlain));
        assert!(matches!(resolve(Supports, None), Decision::RunPlain));

        let err = resolve(Mandatory, None).into_error().expect("mandatory fails");
        assert!(err.is_propagation());
        assert!(err.to_string().contains("no transaction active"));
    }

    #[test]
    fn with_ambient_frame() {
        use Propagation::*;
        let frame = test_frame(EngineId::next(), "", 0);
        let cur = Some(&frame);

        match resolve(Required, cur) {
            Decision::Reuse(f) => assert_eq!(f.id(), frame.id()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(resolve(RequiresNew, cur), Decision::StartNew));
        match resolve(Nested, cur) {
            Decision::StartNested(p) => assert_eq!(p.id(), frame.id()),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(resolve(Mandatory, cur), Decision::Reuse(_)));
        assert!(matches!(resolve(Supports, cur), Decision::Reuse(_)));
        assert!(matches!(
            resolve(NotSupported, cur),
            Decision::SuspendAndRunPlain(_)
        ));

        let never = resolve(Never, cur);
        assert_eq!(never.label(), "fail");
        let err = never.into_error().unwrap();
        assert!(err.to_string().contains("NEVER requested"));
    }

    #[test]
    fn only_start_decisions_open_frames() {
        let frame = test_frame(EngineId::next(), "", 0);
        assert!(Decision::StartNew.opens_frame());
        assert!(Decision::StartNested(frame.clone()).opens_frame());
        assert!(!Decision::Reuse(frame.clone()).opens_frame());
        assert!(!Decision::SuspendAndRunPlain(frame).opens_frame());
        assert!(!Decision::RunPlain.opens_frame());
        assert!(Decision::RunPlain.into_error().is_none());
    }
}
