#![allow(unexpected_cfgs)]
#![allow(unused_imports)]

use tests_common::{Harness, Store, TxFactory};
use txscope_core::{async_trait, TransactionContext, TxError, TxResult};

#[cfg(feature = "libsql-backend")]
struct LibsqlStore {
    db: std::sync::Arc<libsql::Database>,
}

#[cfg(feature = "libsql-backend")]
#[async_trait]
impl Store for LibsqlStore {
    async fn write(&self, ctx: &TransactionContext, key: &str) -> TxResult<()> {
        // Plain scopes write through a fresh autocommit connection.
        let conn = match ctx.connection_as::<txscope_libsql::LibsqlConnection>() {
            Some(c) => c.raw().clone(),
            None => self.db.connect().map_err(TxError::operation)?,
        };
        conn.execute("INSERT INTO kv (k) VALUES (?1)", libsql::params![key])
            .await
            .map_err(TxError::operation)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> TxResult<bool> {
        let conn = self.db.connect().map_err(TxError::operation)?;
        let mut rows = conn
            .query("SELECT 1 FROM kv WHERE k = ?1", libsql::params![key])
            .await
            .map_err(TxError::operation)?;
        Ok(rows.next().await.map_err(TxError::operation)?.is_some())
    }
}

#[cfg(feature = "libsql-backend")]
struct LibsqlFactory {
    dir: tempfile::TempDir,
}

#[cfg(feature = "libsql-backend")]
#[async_trait]
impl TxFactory for LibsqlFactory {
    async fn new_harness(&self) -> TxResult<Harness> {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use txscope_core::{DataSourceRegistry, EngineConfig, TransactionEngine};

        static SEQ: AtomicUsize = AtomicUsize::new(0);
        let path = self
            .dir
            .path()
            .join(format!("conformance_{}.sqlite3", SEQ.fetch_add(1, Ordering::SeqCst)));
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(TxError::operation)?;
        db.connect()
            .map_err(TxError::operation)?
            .execute("CREATE TABLE kv (k TEXT PRIMARY KEY)", ())
            .await
            .map_err(TxError::operation)?;
        let db = Arc::new(db);

        let registry = Arc::new(DataSourceRegistry::new());
        registry.register_default(txscope_libsql::LibsqlConnectionProvider::new(db.clone()))?;
        let engine = Arc::new(TransactionEngine::new(registry));
        engine.initialize(EngineConfig::default())?;
        Ok(Harness {
            engine,
            store: Arc::new(LibsqlStore { db }),
        })
    }
}

#[cfg(feature = "libsql-backend")]
#[tokio::test]
#[ignore = "Excluded from default runs to keep coverage fast and deterministic; run with -- --ignored to execute"]
async fn libsql_propagation_conformance() -> TxResult<()> {
    let factory = LibsqlFactory {
        dir: tempfile::tempdir().map_err(TxError::operation)?,
    };
    tests_common::run_conformance(&factory).await
}
