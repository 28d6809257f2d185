#![forbid(unsafe_code)]
#![cfg_attr(
    not(feature = "postgres-backend"),
    doc = "Enable feature `postgres-backend` to use this adapter."
)]

#[cfg(feature = "postgres-backend")]
mod backend {
    use std::any::Any;
    use std::sync::Arc;
    use std::time::Instant;

    use async_trait::async_trait;
    use tokio_postgres::{Client, NoTls};
    use txscope_core::{
        Connection, ConnectionProvider, Isolation, TransactionDefinition, TxError, TxResult,
    };

    #[inline]
    #[allow(unused_variables)]
    fn obs_record(op: &str, start: Instant, success: bool) {
        let elapsed = start.elapsed().as_millis() as u64;
        #[cfg(feature = "tracing")]
        {
            tracing::debug!(
                backend = "postgres",
                op = op,
                elapsed_ms = elapsed,
                success = success,
                "tx primitive"
            );
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("tx_backend_ops_total", 1, "backend" => "postgres", "op" => op.to_string(), "success" => success.to_string());
            metrics::histogram!("tx_backend_op_duration_ms", elapsed as f64, "backend" => "postgres", "op" => op.to_string());
        }
    }

    pub(crate) fn isolation_sql(isolation: Isolation) -> Option<&'static str> {
        match isolation {
            Isolation::Default => None,
            Isolation::ReadUncommitted => {
                Some("SET TRANSACTION ISOLATION LEVEL READ UNCOMMITTED")
            }
            Isolation::ReadCommitted => Some("SET TRANSACTION ISOLATION LEVEL READ COMMITTED"),
            Isolation::RepeatableRead => Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ"),
            Isolation::Serializable => Some("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE"),
        }
    }

    /// Statements run after `BEGIN` for a definition.
    pub(crate) fn begin_statements(def: &TransactionDefinition) -> Vec<String> {
        let mut stmts = vec!["BEGIN".to_string()];
        if let Some(sql) = isolation_sql(def.isolation) {
            stmts.push(sql.to_string());
        }
        if def.read_only {
            stmts.push("SET TRANSACTION READ ONLY".to_string());
        }
        if let Some(t) = def.timeout {
            stmts.push(format!("SET LOCAL statement_timeout = '{}ms'", t.as_millis()));
        }
        stmts
    }

    /// Opens a dedicated client per physical transaction.
    #[derive(Clone, Debug)]
    pub struct TokioPostgresConnectionProvider {
        conn_str: String,
    }

    impl TokioPostgresConnectionProvider {
        pub fn new<S: Into<String>>(conn_str: S) -> Self {
            Self {
                conn_str: conn_str.into(),
            }
        }

        pub async fn connect(&self) -> TxResult<Client> {
            let (client, connection) = tokio_postgres::connect(&self.conn_str, NoTls)
                .await
                .map_err(TxError::operation)?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "postgres connection error");
                    #[cfg(not(feature = "tracing"))]
                    eprintln!("Postgres connection error: {}", e);
                }
            });
            Ok(client)
        }
    }

    #[async_trait]
    impl ConnectionProvider for TokioPostgresConnectionProvider {
        async fn acquire(&self) -> TxResult<Arc<dyn Connection>> {
            let client = self.connect().await?;
            Ok(Arc::new(PostgresConnection { client }))
        }
    }

    /// A tokio-postgres client driven by the engine. The connection task ends
    /// when this value is dropped.
    pub struct PostgresConnection {
        client: Client,
    }

    impl PostgresConnection {
        pub fn client(&self) -> &Client {
            &self.client
        }

        async fn exec(&self, op: &str, sql: &str) -> TxResult<()> {
            let start = Instant::now();
            let res = self.client.batch_execute(sql).await;
            obs_record(op, start, res.is_ok());
            res.map_err(TxError::operation)
        }
    }

    #[async_trait]
    impl Connection for PostgresConnection {
        async fn begin(&self, def: &TransactionDefinition) -> TxResult<()> {
            // One round trip. If a SET fails the transaction is left aborted; the
            // frame manager drops this connection on a failed begin.
            let sql = begin_statements(def).join("; ");
            self.exec("begin", &sql).await
        }

        async fn commit(&self) -> TxResult<()> {
            self.exec("commit", "COMMIT").await
        }

        async fn rollback(&self) -> TxResult<()> {
            self.exec("rollback", "ROLLBACK").await
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

#[cfg(feature = "postgres-backend")]
pub use backend::{PostgresConnection, TokioPostgresConnectionProvider};
