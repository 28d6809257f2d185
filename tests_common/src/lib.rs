//! Common integration testing utilities and generic tests reusable across backends.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use txscope_core::{
    register_on_commit, register_on_complete, register_on_rollback, Connection,
    ConnectionProvider, DataSourceRegistry, EngineConfig, Outcome, Propagation,
    TransactionContext, TransactionDefinition, TransactionEngine, TxError, TxResult,
};

/// Primitive the memory backend can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Acquire,
    Begin,
    Commit,
    Rollback,
    Savepoint,
    Release,
}

type Rows = BTreeMap<String, String>;

#[derive(Default)]
struct Shared {
    committed: Mutex<Rows>,
    events: Mutex<Vec<String>>,
    pending_failures: Mutex<Vec<Failure>>,
    acquired: AtomicUsize,
    live: AtomicUsize,
}

impl Shared {
    fn log(&self, conn: usize, what: impl AsRef<str>) {
        self.events.lock().push(format!("c{}:{}", conn, what.as_ref()));
    }

    fn take_failure(&self, f: Failure) -> TxResult<()> {
        let mut pending = self.pending_failures.lock();
        match pending.iter().position(|p| *p == f) {
            Some(i) => {
                pending.remove(i);
                Err(TxError::operation(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("injected {:?} failure", f),
                )))
            }
            None => Ok(()),
        }
    }
}

/// In-memory transactional key/value store.
///
/// Each connection buffers its writes until commit; savepoints snapshot the
/// buffer. Other connections only ever see committed rows. Every primitive is
/// appended to an event log (`c{n}:COMMIT`, `c{n}:SAVEPOINT sp_1`, ...) and any
/// primitive can be made to fail once with [`MemoryDatabase::fail_next`].
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot failure for the next call of `failure`.
    pub fn fail_next(&self, failure: Failure) {
        self.shared.pending_failures.lock().push(failure);
    }

    pub fn committed(&self, key: &str) -> Option<String> {
        self.shared.committed.lock().get(key).cloned()
    }

    pub fn committed_rows(&self) -> Rows {
        self.shared.committed.lock().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.shared.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.shared.events.lock().clear();
    }

    /// Number of connections handed out so far.
    pub fn acquired(&self) -> usize {
        self.shared.acquired.load(Ordering::SeqCst)
    }

    /// Connections handed out and not yet dropped.
    pub fn live(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Write through the scope's connection, or autocommit when `ctx` has none.
    pub fn put(&self, ctx: &TransactionContext, key: &str, value: &str) -> TxResult<()> {
        match ctx.connection_as::<MemoryConnection>() {
            Some(conn) => conn.put(key, value),
            None => {
                self.shared
                    .committed
                    .lock()
                    .insert(key.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    /// Read as the scope sees it: its own uncommitted writes first.
    pub fn get(&self, ctx: &TransactionContext, key: &str) -> Option<String> {
        match ctx.connection_as::<MemoryConnection>() {
            Some(conn) => conn.get(key),
            None => self.committed(key),
        }
    }

    /// An initialized engine whose default data source is this database.
    pub fn engine(&self) -> TxResult<Arc<TransactionEngine>> {
        self.engine_with(EngineConfig::default())
    }

    pub fn engine_with(&self, config: EngineConfig) -> TxResult<Arc<TransactionEngine>> {
        let registry = Arc::new(DataSourceRegistry::new());
        registry.register_default(self.clone())?;
        let engine = Arc::new(TransactionEngine::new(registry));
        engine.initialize(config)?;
        Ok(engine)
    }
}

#[async_trait]
impl ConnectionProvider for MemoryDatabase {
    async fn acquire(&self) -> TxResult<Arc<dyn Connection>> {
        self.shared.take_failure(Failure::Acquire)?;
        let id = self.shared.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.live.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            id,
            shared: self.shared.clone(),
            tx: Mutex::new(None),
        }))
    }
}

struct OpenTx {
    read_only: bool,
    writes: Rows,
    savepoints: Vec<(String, Rows)>,
}

/// Connection handed out by [`MemoryDatabase`].
pub struct MemoryConnection {
    id: usize,
    shared: Arc<Shared>,
    tx: Mutex<Option<OpenTx>>,
}

impl MemoryConnection {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn put(&self, key: &str, value: &str) -> TxResult<()> {
        let mut tx = self.tx.lock();
        match tx.as_mut() {
            Some(open) if open.read_only => Err(TxError::operation(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "write in read-only transaction",
            ))),
            Some(open) => {
                open.writes.insert(key.to_string(), value.to_string());
                Ok(())
            }
            None => {
                self.shared
                    .committed
                    .lock()
                    .insert(key.to_string(), value.to_string());
                Ok(())
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(v) = self.tx.lock().as_ref().and_then(|t| t.writes.get(key).cloned()) {
            return Some(v);
        }
        self.shared.committed.lock().get(key).cloned()
    }

    fn open(&self) -> TxResult<parking_lot::MappedMutexGuard<'_, OpenTx>> {
        parking_lot::MutexGuard::try_map(self.tx.lock(), |t| t.as_mut())
            .map_err(|_| TxError::configuration("no transaction open on connection"))
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&self, def: &TransactionDefinition) -> TxResult<()> {
        self.shared.take_failure(Failure::Begin)?;
        *self.tx.lock() = Some(OpenTx {
            read_only: def.read_only,
            writes: Rows::new(),
            savepoints: Vec::new(),
        });
        self.shared.log(self.id, format!("BEGIN {:?}", def.isolation));
        Ok(())
    }

    async fn commit(&self) -> TxResult<()> {
        self.shared.take_failure(Failure::Commit)?;
        let open = self
            .tx
            .lock()
            .take()
            .ok_or_else(|| TxError::configuration("commit without transaction"))?;
        self.shared.committed.lock().extend(open.writes);
        self.shared.log(self.id, "COMMIT");
        Ok(())
    }

    async fn rollback(&self) -> TxResult<()> {
        self.shared.take_failure(Failure::Rollback)?;
        self.tx.lock().take();
        self.shared.log(self.id, "ROLLBACK");
        Ok(())
    }

    async fn savepoint(&self, name: &str) -> TxResult<()> {
        self.shared.take_failure(Failure::Savepoint)?;
        let mut open = self.open()?;
        let snapshot = open.writes.clone();
        open.savepoints.push((name.to_string(), snapshot));
        drop(open);
        self.shared.log(self.id, format!("SAVEPOINT {}", name));
        Ok(())
    }

    async fn release_savepoint(&self, name: &str) -> TxResult<()> {
        self.shared.take_failure(Failure::Release)?;
        let mut open = self.open()?;
        let at = open
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| TxError::configuration(format!("unknown savepoint {}", name)))?;
        open.savepoints.truncate(at);
        drop(open);
        self.shared.log(self.id, format!("RELEASE {}", name));
        Ok(())
    }

    async fn rollback_to_savepoint(&self, name: &str) -> TxResult<()> {
        let mut open = self.open()?;
        let at = open
            .savepoints
            .iter()
            .rposition(|(n, _)| n == name)
            .ok_or_else(|| TxError::configuration(format!("unknown savepoint {}", name)))?;
        // The savepoint itself stays defined after ROLLBACK TO.
        let snapshot = open.savepoints[at].1.clone();
        open.savepoints.truncate(at + 1);
        open.writes = snapshot;
        drop(open);
        self.shared.log(self.id, format!("ROLLBACK TO {}", name));
        Ok(())
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// Backend-specific row access used by the generic tests.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert `key` through the scope's connection (autocommit when plain).
    async fn write(&self, ctx: &TransactionContext, key: &str) -> TxResult<()>;

    /// Whether `key` is visible outside any transaction.
    async fn exists(&self, key: &str) -> TxResult<bool>;
}

pub struct Harness {
    pub engine: Arc<TransactionEngine>,
    pub store: Arc<dyn Store>,
}

#[async_trait]
pub trait TxFactory {
    /// Construct an initialized engine over a clean database with the required schema.
    async fn new_harness(&self) -> TxResult<Harness>;
}

fn def(p: Propagation) -> TransactionDefinition {
    TransactionDefinition::new(p)
}

/// Nested REQUIRED scopes share the outermost frame and commit once.
pub async fn test_required_joins_outer<F: TxFactory + Sync>(f: &F) -> TxResult<()> {
    let Harness { engine, store } = f.new_harness().await?;
    let (e, s) = (engine.clone(), store.clone());
    engine
        .run_in_context(&def(Propagation::Required), move |outer| async move {
            let outer_id = outer.frame().map(|fr| fr.id());
            s.write(&outer, "outer").await?;
            let s2 = s.clone();
            e.run_in_context(&def(Propagation::Required), move |inner| async move {
                assert!(!inner.is_new_transaction());
                assert_eq!(inner.frame().map(|fr| fr.id()), outer_id);
                s2.write(&inner, "inner").await
            })
            .await?;
            assert!(!s.exists("inner").await?);
            Ok::<_, TxError>(())
        })
        .await?;
    assert!(store.exists("outer").await?);
    assert!(store.exists("inner").await?);
    Ok(())
}

/// Row A written by the outer scope survives; row B from a failed REQUIRES_NEW does not.
pub async fn test_requires_new_isolates_inner_failure<F: TxFactory + Sync>(
    f: &F,
) -> TxResult<()> {
    let Harness { engine, store } = f.new_harness().await?;
    let (e, s) = (engine.clone(), store.clone());
    engine
        .run_in_context(&def(Propagation::Required), move |outer| async move {
            s.write(&outer, "A").await?;
            let s2 = s.clone();
            let inner = e
                .run_in_context(&def(Propagation::RequiresNew), move |ctx| async move {
                    assert!(ctx.is_new_transaction());
                    s2.write(&ctx, "B").await?;
                    Err::<(), _>(TxError::application(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "inner failure",
                    )))
                })
                .await;
            assert!(inner.is_err());
            Ok::<_, TxError>(())
        })
        .await?;
    assert!(store.exists("A").await?);
    assert!(!store.exists("B").await?);
    Ok(())
}

/// A failing NESTED scope rolls back to its savepoint only.
pub async fn test_nested_rolls_back_to_savepoint<F: TxFactory + Sync>(f: &F) -> TxResult<()> {
    let Harness { engine, store } = f.new_harness().await?;
    let (e, s) = (engine.clone(), store.clone());
    engine
        .run_in_context(&def(Propagation::Required), move |outer| async move {
            s.write(&outer, "before").await?;
            let s2 = s.clone();
            let failed = e
                .run_in_context(&def(Propagation::Nested), move |ctx| async move {
                    assert_eq!(ctx.depth(), Some(1));
                    assert!(ctx.savepoint().is_some());
                    s2.write(&ctx, "discarded").await?;
                    Err::<(), _>(TxError::configuration("nested failure"))
                })
                .await;
            assert!(failed.is_err());
            let s3 = s.clone();
            e.run_in_context(&def(Propagation::Nested), move |ctx| async move {
                s3.write(&ctx, "kept").await
            })
            .await?;
            s.write(&outer, "after").await
        })
        .await?;
    assert!(store.exists("before").await?);
    assert!(!store.exists("discarded").await?);
    assert!(store.exists("kept").await?);
    assert!(store.exists("after").await?);
    Ok(())
}

/// MANDATORY without an ambient transaction never reaches the work.
pub async fn test_mandatory_requires_transaction<F: TxFactory + Sync>(f: &F) -> TxResult<()> {
    let Harness { engine, store } = f.new_harness().await?;
    let s = store.clone();
    let err = engine
        .run_in_context(&def(Propagation::Mandatory), move |ctx| async move {
            s.write(&ctx, "never").await
        })
        .await
        .err()
        .ok_or_else(|| TxError::configuration("MANDATORY ran without a transaction"))?;
    assert!(err.is_propagation());
    assert!(!store.exists("never").await?);
    Ok(())
}

/// NEVER inside a transaction fails and leaves the ambient transaction usable.
pub async fn test_never_rejects_ambient<F: TxFactory + Sync>(f: &F) -> TxResult<()> {
    let Harness { engine, store } = f.new_harness().await?;
    let (e, s) = (engine.clone(), store.clone());
    engine
        .run_in_context(&def(Propagation::Required), move |outer| async move {
            s.write(&outer, "ambient").await?;
            let err = e
                .run_in_context(&def(Propagation::Never), |_| async { Ok::<_, TxError>(()) })
                .await
                .unwrap_err();
            assert!(err.is_propagation());
            assert!(outer.frame().map(|fr| !fr.status().is_terminal()).unwrap_or(false));
            s.write(&outer, "ambient2").await
        })
        .await?;
    assert!(store.exists("ambient").await?);
    assert!(store.exists("ambient2").await?);
    Ok(())
}

/// Commit hooks fire only on commit, rollback hooks only on rollback, complete once.
pub async fn test_hooks_fire_once<F: TxFactory + Sync>(f: &F) -> TxResult<()> {
    let Harness { engine, .. } = f.new_harness().await?;
    for fail in [false, true] {
        let log = Arc::new(Mutex::new(Vec::<String>::new()));
        let l = log.clone();
        let res = engine
            .run_in_context(&def(Propagation::Required), move |_| async move {
                let (a, b, c) = (l.clone(), l.clone(), l.clone());
                register_on_commit(move || async move {
                    a.lock().push("commit".into());
                    Ok::<_, TxError>(())
                })?;
                register_on_rollback(move || async move {
                    b.lock().push("rollback".into());
                    Ok::<_, TxError>(())
                })?;
                register_on_complete(move |o: Outcome| async move {
                    c.lock().push(format!("complete:{:?}", o));
                    Ok::<_, TxError>(())
                })?;
                if fail {
                    Err(TxError::configuration("work failed"))
                } else {
                    Ok(())
                }
            })
            .await;
        assert_eq!(res.is_err(), fail);
        let expected = if fail {
            vec!["rollback", "complete:Rollback"]
        } else {
            vec!["commit", "complete:Commit"]
        };
        assert_eq!(*log.lock(), expected);
    }
    Ok(())
}

/// Work failing inside an owned transaction leaves nothing behind.
pub async fn test_rollback_on_error<F: TxFactory + Sync>(f: &F) -> TxResult<()> {
    let Harness { engine, store } = f.new_harness().await?;
    let s = store.clone();
    let res = engine
        .run_in_context(&def(Propagation::Required), move |ctx| async move {
            s.write(&ctx, "doomed").await?;
            Err::<(), _>(TxError::configuration("boom"))
        })
        .await;
    assert!(res.is_err());
    assert!(!store.exists("doomed").await?);
    Ok(())
}

/// Run every generic test against `f`.
pub async fn run_conformance<F: TxFactory + Sync>(f: &F) -> TxResult<()> {
    test_required_joins_outer(f).await?;
    test_requires_new_isolates_inner_failure(f).await?;
    test_nested_rolls_back_to_savepoint(f).await?;
    test_mandatory_requires_transaction(f).await?;
    test_never_rejects_ambient(f).await?;
    test_hooks_fire_once(f).await?;
    test_rollback_on_error(f).await?;
    Ok(())
}

/// [`TxFactory`] over a fresh [`MemoryDatabase`] per harness.
#[derive(Default)]
pub struct MemoryFactory;

struct MemoryStore(MemoryDatabase);

#[async_trait]
impl Store for MemoryStore {
    async fn write(&self, ctx: &TransactionContext, key: &str) -> TxResult<()> {
        self.0.put(ctx, key, "1")
    }

    async fn exists(&self, key: &str) -> TxResult<bool> {
        Ok(self.0.committed(key).is_some())
    }
}

#[async_trait]
impl TxFactory for MemoryFactory {
    async fn new_harness(&self) -> TxResult<Harness> {
        let db = MemoryDatabase::new();
        Ok(Harness {
            engine: db.engine()?,
            store: Arc::new(MemoryStore(db)),
        })
    }
}
