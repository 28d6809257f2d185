//! Commit, rollback and completion callbacks attached to a frame.
//!
//! Callbacks are registered against the top-most frame of the calling task's context
//! and fire exactly once, after the frame reaches a terminal status. Outside a
//! transaction registration is a silent no-op.

use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::context::ContextStack;
use crate::error::{BoxError, TxError, TxResult};
use crate::transactions::Outcome;

pub(crate) type Hook = Box<dyn FnOnce(Outcome) -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// Which list a callback belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    Commit,
    Rollback,
    Complete,
}

/// A single callback failure collected during dispatch.
#[derive(Debug)]
pub struct HookFailure {
    pub kind: HookKind,
    /// Position of the callback within its list.
    pub index: usize,
    pub source: BoxError,
}

impl std::fmt::Display for HookFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} hook #{} failed: {}", self.kind, self.index, self.source)
    }
}

/// What to do with hook failures once every callback has run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum HookErrorPolicy {
    /// Return them to the caller as [`TxError::Hooks`].
    #[default]
    Raise,
    /// Log them and report success.
    Log,
}

#[derive(Default)]
pub(crate) struct HookLists {
    commit: Vec<Hook>,
    rollback: Vec<Hook>,
    complete: Vec<Hook>,
}

impl HookLists {
    fn list_mut(&mut self, kind: HookKind) -> &mut Vec<Hook> {
        match kind {
            HookKind::Commit => &mut self.commit,
            HookKind::Rollback => &mut self.rollback,
            HookKind::Complete => &mut self.complete,
        }
    }

    pub(crate) fn len(&self, kind: HookKind) -> usize {
        match kind {
            HookKind::Commit => self.commit.len(),
            HookKind::Rollback => self.rollback.len(),
            HookKind::Complete => self.complete.len(),
        }
    }

    pub(crate) fn push(&mut self, kind: HookKind, hook: Hook, max: usize) -> TxResult<()> {
        let list = self.list_mut(kind);
        if list.len() >= max {
            return Err(TxError::configuration(format!(
                "too many {:?} hooks registered on one transaction (limit {})",
                kind, max
            )));
        }
        list.push(hook);
        Ok(())
    }

    /// Callbacks to run for `outcome`, in dispatch order. The lists that do not
    /// apply are discarded.
    fn into_ordered(self, outcome: Outcome) -> [(HookKind, Vec<Hook>); 2] {
        match outcome {
            Outcome::Commit => [
                (HookKind::Commit, self.commit),
                (HookKind::Complete, self.complete),
            ],
            Outcome::Rollback => [
                (HookKind::Rollback, self.rollback),
                (HookKind::Complete, self.complete),
            ],
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("hook panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("hook panicked: {}", s)
    } else {
        "hook panicked".to_string()
    }
}

/// Run every applicable callback in registration order. A failing or panicking
/// callback never stops the ones after it.
pub(crate) async fn dispatch(hooks: HookLists, outcome: Outcome) -> Vec<HookFailure> {
    let mut failures = Vec::new();
    for (kind, list) in hooks.into_ordered(outcome) {
        for (index, hook) in list.into_iter().enumerate() {
            let run = AssertUnwindSafe(async move { hook(outcome).await }).catch_unwind();
            match run.await {
                Ok(Ok(())) => {}
                Ok(Err(source)) => failures.push(HookFailure {
                    kind,
                    index,
                    source,
                }),
                Err(payload) => failures.push(HookFailure {
                    kind,
                    index,
                    source: panic_message(payload).into(),
                }),
            }
        }
    }
    failures
}

pub(crate) fn boxed<F, Fut, E>(f: F) -> Hook
where
    F: FnOnce(Outcome) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    Box::new(move |outcome| Box::pin(async move { f(outcome).await.map_err(Into::into) }))
}

fn register(kind: HookKind, hook: Hook) -> TxResult<()> {
    match ContextStack::current().top() {
        Some(frame) => frame.add_hook(kind, hook),
        None => Ok(()),
    }
}

/// Run `f` after the current frame commits.
pub fn register_on_commit<F, Fut, E>(f: F) -> TxResult<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    register(HookKind::Commit, boxed(move |_| f()))
}

/// Run `f` after the current frame rolls back.
pub fn register_on_rollback<F, Fut, E>(f: F) -> TxResult<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    register(HookKind::Rollback, boxed(move |_| f()))
}

/// Run `f` after the current frame terminates either way. The callback receives
/// the final outcome.
pub fn register_on_complete<F, Fut, E>(f: F) -> TxResult<()>
where
    F: FnOnce(Outcome) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<BoxError>,
{
    register(HookKind::Complete, boxed(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> Hook {
        let log = log.clone();
        boxed(move |outcome| async move {
            log.lock().push(format!("{}:{:?}", tag, outcome));
            Ok::<_, TxError>(())
        })
    }

    #[test]
    fn commit_runs_commit_then_complete_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookLists::default();
        hooks.push(HookKind::Complete, recorder(&log, "done"), 10).unwrap();
        hooks.push(HookKind::Commit, recorder(&log, "c1"), 10).unwrap();
        hooks.push(HookKind::Rollback, recorder(&log, "r1"), 10).unwrap();
        hooks.push(HookKind::Commit, recorder(&log, "c2"), 10).unwrap();

        let failures = futures::executor::block_on(dispatch(hooks, Outcome::Commit));
        assert!(failures.is_empty());
        assert_eq!(
            *log.lock(),
            vec!["c1:Commit", "c2:Commit", "done:Commit"]
        );
    }

    #[test]
    fn rollback_runs_rollback_then_complete() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookLists::default();
        hooks.push(HookKind::Commit, recorder(&log, "c1"), 10).unwrap();
        hooks.push(HookKind::Rollback, recorder(&log, "r1"), 10).unwrap();
        hooks.push(HookKind::Complete, recorder(&log, "done"), 10).unwrap();

        futures::executor::block_on(dispatch(hooks, Outcome::Rollback));
        assert_eq!(*log.lock(), vec!["r1:Rollback", "done:Rollback"]);
    }

    #[test]
    fn failing_and_panicking_hooks_do_not_stop_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookLists::default();
        hooks
            .push(
                HookKind::Commit,
                boxed(|_| async { Err::<(), _>(TxError::configuration("first")) }),
                10,
            )
            .unwrap();
        hooks
            .push(
                HookKind::Commit,
                boxed(|_| async {
                    if true {
                        panic!("second");
                    }
                    Ok::<_, TxError>(())
                }),
                10,
            )
            .unwrap();
        hooks.push(HookKind::Commit, recorder(&log, "third"), 10).unwrap();
        hooks.push(HookKind::Complete, recorder(&log, "done"), 10).unwrap();

        let failures = futures::executor::block_on(dispatch(hooks, Outcome::Commit));
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].kind, HookKind::Commit);
        assert_eq!(failures[0].index, 0);
        assert_eq!(failures[1].index, 1);
        assert!(failures[1].source.to_string().contains("second"));
        assert_eq!(*log.lock(), vec!["third:Commit", "done:Commit"]);
    }

    #[test]
    fn limit_is_enforced_per_kind() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookLists::default();
        hooks.push(HookKind::Commit, recorder(&log, "a"), 2).unwrap();
        hooks.push(HookKind::Commit, recorder(&log, "b"), 2).unwrap();
        let err = hooks
            .push(HookKind::Commit, recorder(&log, "c"), 2)
            .unwrap_err();
        assert!(err.is_configuration());
        hooks.push(HookKind::Rollback, recorder(&log, "r"), 2).unwrap();
        assert_eq!(hooks.len(HookKind::Commit), 2);
        assert_eq!(hooks.len(HookKind::Rollback), 1);
    }

    #[test]
    fn registration_outside_a_transaction_is_a_no_op() {
        futures::executor::block_on(async {
            register_on_commit(|| async { Ok::<_, TxError>(()) }).unwrap();
            register_on_rollback(|| async { Ok::<_, TxError>(()) }).unwrap();
            register_on_complete(|_| async { Ok::<_, TxError>(()) }).unwrap();
        });
    }
}
