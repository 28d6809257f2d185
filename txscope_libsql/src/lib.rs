#![forbid(unsafe_code)]
#![cfg_attr(
    not(feature = "libsql-backend"),
    doc = "Enable feature `libsql-backend` to use this adapter."
)]

#[cfg(feature = "libsql-backend")]
mod backend {
    use std::any::Any;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use async_trait::async_trait;
    use libsql::Database;
    use txscope_core::{
        Connection, ConnectionProvider, Isolation, TransactionDefinition, TxError, TxResult,
    };

    #[cfg(feature = "tracing")]
    use tracing::debug;

    #[inline]
    #[allow(unused_variables)]
    fn obs_record(op: &str, start: Instant, success: bool) {
        let elapsed = start.elapsed().as_millis() as u64;
        #[cfg(feature = "tracing")]
        {
            debug!(
                backend = "libsql",
                op = op,
                elapsed_ms = elapsed,
                success = success,
                "tx primitive"
            );
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("tx_backend_ops_total", 1, "backend" => "libsql", "op" => op.to_string(), "success" => success.to_string());
            metrics::histogram!("tx_backend_op_duration_ms", elapsed as f64, "backend" => "libsql", "op" => op.to_string());
        }
    }

    pub(crate) fn begin_sql(isolation: Isolation) -> &'static str {
        match isolation {
            Isolation::Default | Isolation::ReadUncommitted | Isolation::ReadCommitted => {
                "BEGIN DEFERRED"
            }
            Isolation::RepeatableRead => "BEGIN IMMEDIATE",
            Isolation::Serializable => "BEGIN EXCLUSIVE",
        }
    }

    /// Busy timeout applied when the definition carries none.
    const DEFAULT_BUSY_TIMEOUT_MS: u128 = 1000;

    /// Hands out one libsql connection per physical transaction.
    #[derive(Clone)]
    pub struct LibsqlConnectionProvider {
        db: Arc<Database>,
    }

    impl LibsqlConnectionProvider {
        pub fn new(db: Arc<Database>) -> Self {
            Self { db }
        }

        pub fn database(&self) -> &Arc<Database> {
            &self.db
        }
    }

    #[async_trait]
    impl ConnectionProvider for LibsqlConnectionProvider {
        async fn acquire(&self) -> TxResult<Arc<dyn Connection>> {
            let conn = self.db.connect().map_err(TxError::operation)?;
            Ok(Arc::new(LibsqlConnection::new(conn)))
        }
    }

    /// A libsql connection driven by the engine. Work reaches the driver through
    /// [`raw`](Self::raw), usually via `ctx.connection_as::<LibsqlConnection>()`.
    pub struct LibsqlConnection {
        conn: libsql::Connection,
        query_only: AtomicBool,
    }

    impl LibsqlConnection {
        pub fn new(conn: libsql::Connection) -> Self {
            Self {
                conn,
                query_only: AtomicBool::new(false),
            }
        }

        pub fn raw(&self) -> &libsql::Connection {
            &self.conn
        }

        async fn exec(&self, op: &str, sql: &str) -> TxResult<()> {
            let start = Instant::now();
            let res = self.conn.execute(sql, ()).await;
            obs_record(op, start, res.is_ok());
            res.map(|_| ()).map_err(TxError::operation)
        }

        /// Read-only transactions flip `query_only` on the connection; turn it back off.
        async fn reset_query_only(&self) {
            if self.query_only.swap(false, Ordering::SeqCst) {
                self.conn.execute("PRAGMA query_only = OFF", ()).await.ok();
            }
        }
    }

    #[async_trait]
    impl Connection for LibsqlConnection {
        async fn begin(&self, def: &TransactionDefinition) -> TxResult<()> {
            if def.read_only {
                self.exec("query_only", "PRAGMA query_only = ON").await?;
                self.query_only.store(true, Ordering::SeqCst);
            }
            let busy_ms = def
                .timeout
                .map(|d| d.as_millis())
                .unwrap_or(DEFAULT_BUSY_TIMEOUT_MS);
            self.exec("busy_timeout", &format!("PRAGMA busy_timeout = {}", busy_ms))
                .await?;
            self.exec("begin", begin_sql(def.isolation)).await
        }

        async fn commit(&self) -> TxResult<()> {
            let res = self.exec("commit", "COMMIT").await;
            if res.is_ok() {
                self.reset_query_only().await;
            }
            res
        }

        async fn rollback(&self) -> TxResult<()> {
            let res = self.exec("rollback", "ROLLBACK").await;
            self.reset_query_only().await;
            res
        }

        async fn savepoint(&self, name: &str) -> TxResult<()> {
            self.exec("savepoint", &format!("SAVEPOINT {}", name)).await
        }

        async fn release_savepoint(&self, name: &str) -> TxResult<()> {
            self.exec("release", &format!("RELEASE SAVEPOINT {}", name))
                .await
        }

        async fn rollback_to_savepoint(&self, name: &str) -> TxResult<()> {
            self.exec("rollback_to", &format!("ROLLBACK TO SAVEPOINT {}", name))
                .await
        }

        fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
            self
        }
    }
}

#[cfg(feature = "libsql-backend")]
pub use backend::{LibsqlConnection, LibsqlConnectionProvider};
