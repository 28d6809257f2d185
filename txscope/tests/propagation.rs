use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tests_common::{MemoryConnection, MemoryDatabase};
use txscope::frame::FrameManager;
use txscope::{
    DataSourceRegistry, Decision, EngineConfig, EngineId, FrameStatus, Outcome, Propagation,
    TransactionDefinition, TransactionEngine, TxError,
};

fn setup() -> (MemoryDatabase, Arc<TransactionEngine>) {
    let db = MemoryDatabase::new();
    let engine = db.engine().expect("engine");
    (db, engine)
}

fn def(p: Propagation) -> TransactionDefinition {
    txscope::definition(p)
}

fn fail(msg: &str) -> TxError {
    TxError::application(std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()))
}

#[tokio::test]
async fn required_chain_opens_a_single_transaction() {
    let (db, engine) = setup();
    let (e, d) = (engine.clone(), db.clone());
    engine
        .run_in_context(&def(Propagation::Required), move |ctx| async move {
            d.put(&ctx, "a", "1")?;
            let (e2, d2) = (e.clone(), d.clone());
            e.run_in_context(&def(Propagation::Required), move |ctx| async move {
                d2.put(&ctx, "b", "1")?;
                let d3 = d2.clone();
                e2.run_in_context(&def(Propagation::Required), move |ctx| async move {
                    assert!(!ctx.is_new_transaction());
                    assert_eq!(ctx.depth(), Some(0));
                    d3.put(&ctx, "c", "1")
                })
                .await
            })
            .await
        })
        .await
        .unwrap();

    assert_eq!(db.acquired(), 1);
    assert_eq!(db.events(), vec!["c1:BEGIN Default", "c1:COMMIT"]);
    assert_eq!(db.committed_rows().len(), 3);
    assert_eq!(db.live(), 0);
}

#[tokio::test]
async fn requires_new_failure_does_not_touch_outer() {
    let (db, engine) = setup();
    let (e, d) = (engine.clone(), db.clone());
    engine
        .run_in_context(&def(Propagation::Required), move |outer| async move {
            d.put(&outer, "A", "1")?;
            let d2 = d.clone();
            let outer_id = outer.frame().unwrap().id();
            let inner = e
                .run_in_context(&def(Propagation::RequiresNew), move |ctx| async move {
                    assert!(ctx.is_new_transaction());
                    assert_ne!(ctx.frame().unwrap().id(), outer_id);
                    d2.put(&ctx, "B", "1")?;
                    Err::<(), _>(fail("inner failure"))
                })
                .await;
            assert!(matches!(inner, Err(TxError::Application { .. })));
            assert_eq!(outer.frame().unwrap().status(), FrameStatus::Active);
            assert_eq!(d.get(&outer, "A").as_deref(), Some("1"));
            Ok::<_, TxError>(())
        })
        .await
        .unwrap();

    assert_eq!(db.committed("A").as_deref(), Some("1"));
    assert!(db.committed("B").is_none());
    assert_eq!(db.acquired(), 2);
    assert_eq!(
        db.events(),
        vec!["c1:BEGIN Default", "c2:BEGIN Default", "c2:ROLLBACK", "c1:COMMIT"]
    );
}

#[tokio::test]
async fn requires_new_commit_survives_outer_rollback() {
    let (db, engine) = setup();
    let (e, d) = (engine.clone(), db.clone());
    let res = engine
        .run_in_context(&def(Propagation::Required), move |outer| async move {
            d.put(&outer, "A", "1")?;
            let d2 = d.clone();
            e.run_in_context(&def(Propagation::RequiresNew), move |ctx| async move {
                d2.put(&ctx, "B", "1")
            })
            .await?;
            Err::<(), _>(fail("outer failure"))
        })
        .await;
    assert!(res.is_err());
    assert!(db.committed("A").is_none());
    assert_eq!(db.committed("B").as_deref(), Some("1"));
}

#[tokio::test]
async fn nested_failure_rolls_back_to_its_savepoint_only() {
    let (db, engine) = setup();
    let (e, d) = (engine.clone(), db.clone());
    engine
        .run_in_context(&def(Propagation::Required), move |outer| async move {
            d.put(&outer, "before", "1")?;
            let d2 = d.clone();
            let nested = e
                .run_in_context(&def(Propagation::Nested), move |ctx| async move {
                    assert_eq!(ctx.savepoint(), Some("sp_1"));
                    assert!(ctx.is_new_transaction());
                    d2.put(&ctx, "discarded", "1")?;
                    Err::<(), _>(fail("nested failure"))
                })
                .await;
            assert!(nested.is_err());
            assert!(d.get(&outer, "discarded").is_none());
            assert_eq!(d.get(&outer, "before").as_deref(), Some("1"));

            let d3 = d.clone();
            e.run_in_context(&def(Propagation::Nested), move |ctx| async move {
                assert_eq!(ctx.savepoint(), Some("sp_2"));
                d3.put(&ctx, "kept", "1")
            })
            .await
        })
        .await
        .unwrap();

    assert_eq!(db.committed("before").as_deref(), Some("1"));
    assert_eq!(db.committed("kept").as_deref(), Some("1"));
    assert!(db.committed("discarded").is_none());
    assert_eq!(
        db.events(),
        vec![
            "c1:BEGIN Default",
            "c1:SAVEPOINT sp_1",
            "c1:ROLLBACK TO sp_1",
            "c1:SAVEPOINT sp_2",
            "c1:RELEASE sp_2",
            "c1:COMMIT",
        ]
    );
}

#[tokio::test]
async fn nested_without_ambient_starts_a_transaction() {
    let (db, engine) = setup();
    engine
        .run_in_context(&def(Propagation::Nested), |ctx| async move {
            assert!(ctx.is_new_transaction());
            assert_eq!(ctx.depth(), Some(0));
            assert!(ctx.savepoint().is_none());
            Ok::<_, TxError>(())
        })
        .await
        .unwrap();
    assert_eq!(db.events(), vec!["c1:BEGIN Default", "c1:COMMIT"]);
}

#[tokio::test]
async fn mandatory_without_transaction_fails_before_any_write() {
    let (db, engine) = setup();
    let ran = Arc::new(AtomicBool::new(false));
    let (r, d) = (ran.clone(), db.clone());
    let err = engine
        .run_in_context(&def(Propagation::Mandatory), move |ctx| async move {
            r.store(true, Ordering::SeqCst);
            d.put(&ctx, "x", "1")
        })
        .await
        .unwrap_err();
    assert!(err.is_propagation());
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(db.acquired(), 0);
    assert!(db.committed_rows().is_empty());
}

#[tokio::test]
async fn mandatory_joins_the_ambient_transaction() {
    let (db, engine) = setup();
    let e = engine.clone();
    engine
        .run_in_context(&def(Propagation::Required), move |outer| async move {
            let id = outer.frame().unwrap().id();
            e.run_in_context(&def(Propagation::Mandatory), move |ctx| async move {
                assert_eq!(ctx.frame().unwrap().id(), id);
                Ok::<_, TxError>(())
            })
            .await
        })
        .await
        .unwrap();
    assert_eq!(db.acquired(), 1);
}

#[tokio::test]
async fn never_rejects_an_ambient_transaction_without_disturbing_it() {
    let (db, engine) = setup();
    let (e, d) = (engine.clone(), db.clone());
    engine
        .run_in_context(&def(Propagation::Required), move |outer| async move {
            d.put(&outer, "a", "1")?;
            let err = e
                .run_in_context(&def(Propagation::Never), |_| async { Ok::<_, TxError>(()) })
                .await
                .unwrap_err();
            assert!(err.is_propagation());
            assert_eq!(outer.frame().unwrap().status(), FrameStatus::Active);
            d.put(&outer, "b", "1")
        })
        .await
        .unwrap();
    assert_eq!(db.committed_rows().len(), 2);
    assert_eq!(db.events(), vec!["c1:BEGIN Default", "c1:COMMIT"]);

    engine
        .run_in_context(&def(Propagation::Never), |ctx| async move {
            assert!(!ctx.is_transactional());
            Ok::<_, TxError>(())
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn not_supported_suspends_and_restores() {
    let (db, engine) = setup();
    let (e, d) = (engine.clone(), db.clone());
    let res = engine
        .run_in_context(&def(Propagation::Required), move |outer| async move {
            let id = outer.frame().unwrap().id();
            d.put(&outer, "tx", "1")?;
            let (e2, d2) = (e.clone(), d.clone());
            e.run_in_context(&def(Propagation::NotSupported), move |ctx| async move {
                assert!(!ctx.is_transactional());
                assert!(e2.current_frame("").is_none());
                // Autocommits outside the suspended transaction.
                d2.put(&ctx, "plain", "1")?;
                assert!(d2.committed("plain").is_some());
                Ok::<_, TxError>(())
            })
            .await?;
            assert_eq!(e.current_frame("").map(|f| f.id()), Some(id));
            Err::<(), _>(fail("roll back the suspended transaction"))
        })
        .await;
    assert!(res.is_err());
    assert!(db.committed("tx").is_none());
    assert_eq!(db.committed("plain").as_deref(), Some("1"));
}

#[tokio::test]
async fn supports_follows_the_ambient_state() {
    let (db, engine) = setup();
    engine
        .run_in_context(&def(Propagation::Supports), |ctx| async move {
            assert!(!ctx.is_transactional());
            Ok::<_, TxError>(())
        })
        .await
        .unwrap();
    assert_eq!(db.acquired(), 0);

    let e = engine.clone();
    engine
        .run_in_context(&def(Propagation::Required), move |_| async move {
            e.run_in_context(&def(Propagation::Supports), |ctx| async move {
                assert!(ctx.is_transactional());
                assert!(!ctx.is_new_transaction());
                Ok::<_, TxError>(())
            })
            .await
        })
        .await
        .unwrap();
    assert_eq!(db.acquired(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_tasks_never_see_each_others_frames() {
    let (db, engine) = setup();
    let mut handles = Vec::new();
    for i in 0..16usize {
        let (e, d) = (engine.clone(), db.clone());
        handles.push(tokio::spawn(async move {
            let e2 = e.clone();
            e.run_in_context(&def(Propagation::Required), move |ctx| async move {
                let frame = ctx.frame().unwrap().clone();
                let conn = ctx.connection_as::<MemoryConnection>().unwrap().id();
                for _ in 0..(i % 4) {
                    tokio::task::yield_now().await;
                }
                d.put(&ctx, &format!("k{}", i), "1")?;
                let seen = e2.current_frame("").unwrap();
                assert_eq!(seen.id(), frame.id());
                assert!(ctx.is_new_transaction());
                Ok::<_, TxError>(conn)
            })
            .await
        }));
    }
    let mut connections = HashSet::new();
    for h in handles {
        connections.insert(h.await.unwrap().unwrap());
    }
    assert_eq!(connections.len(), 16);
    assert_eq!(db.acquired(), 16);
    assert_eq!(db.committed_rows().len(), 16);
    assert_eq!(db.live(), 0);
}

#[tokio::test]
async fn ending_a_terminated_frame_is_rejected() {
    let db = MemoryDatabase::new();
    let registry = Arc::new(DataSourceRegistry::new());
    registry.register_default(db.clone()).unwrap();
    let manager = FrameManager::new(EngineId::next(), registry, EngineConfig::default());

    let handle = manager
        .begin(Decision::StartNew, &TransactionDefinition::default(), "")
        .await
        .unwrap();
    manager.end(&handle, Outcome::Commit).await.unwrap();

    let again = manager.end(&handle, Outcome::Commit).await.unwrap_err();
    assert!(again.is_configuration());
    let rollback = manager.end(&handle, Outcome::Rollback).await.unwrap_err();
    assert!(rollback.is_configuration());
    assert_eq!(handle.frame().status(), FrameStatus::Committed);
    assert_eq!(db.events(), vec!["c1:BEGIN Default", "c1:COMMIT"]);
}

#[tokio::test]
async fn data_sources_are_tracked_independently() {
    let (a, b) = (MemoryDatabase::new(), MemoryDatabase::new());
    let registry = Arc::new(DataSourceRegistry::new());
    registry.register("a", a.clone()).unwrap();
    registry.register("b", b.clone()).unwrap();
    let engine = Arc::new(TransactionEngine::new(registry));
    engine.initialize(EngineConfig::default()).unwrap();

    let on = |name: &str| def(Propagation::Required).with_data_source(name);
    let e = engine.clone();
    engine
        .run_in_context(&on("a"), move |ctx_a| async move {
            let a_id = ctx_a.frame().unwrap().id();
            let e2 = e.clone();
            e.run_in_context(&on("b"), move |ctx_b| async move {
                assert!(ctx_b.is_new_transaction());
                assert_eq!(ctx_b.data_source(), Some("b"));
                e2.run_in_context(&on("a"), move |again| async move {
                    assert!(!again.is_new_transaction());
                    assert_eq!(again.frame().unwrap().id(), a_id);
                    Ok::<_, TxError>(())
                })
                .await
            })
            .await
        })
        .await
        .unwrap();
    assert_eq!(a.acquired(), 1);
    assert_eq!(b.acquired(), 1);

    let err = engine
        .run_in_context(&on("missing"), |_| async { Ok::<_, TxError>(()) })
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    // The unnamed default does not resolve when several sources are registered.
    let err = engine
        .run_in_context(&def(Propagation::Required), |_| async { Ok::<_, TxError>(()) })
        .await
        .unwrap_err();
    assert!(err.is_configuration());
}
