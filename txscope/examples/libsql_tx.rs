// Run with:
//   cargo run -p txscope --features libsql-backend --example libsql_tx
// Demonstrates commit, rollback and a savepoint with the LibSQL backend.

use std::sync::Arc;

use txscope::backends::{libsql, LibsqlConnection, LibsqlConnectionProvider};
use txscope::{
    DataSourceRegistry, EngineConfig, Propagation, TransactionContext, TransactionDefinition,
    TransactionEngine, TxError, TxResult,
};

async fn insert(ctx: &TransactionContext, email: &str) -> TxResult<()> {
    let conn = ctx
        .connection_as::<LibsqlConnection>()
        .ok_or_else(|| TxError::configuration("not inside a libsql transaction"))?;
    conn.raw()
        .execute("INSERT INTO users (email) VALUES (?1)", libsql::params![email])
        .await
        .map_err(TxError::operation)?;
    Ok(())
}

#[tokio::main]
async fn main() -> TxResult<()> {
    let dir = std::env::temp_dir().join("txscope_libsql_example.sqlite3");
    let _ = std::fs::remove_file(&dir);
    let db = libsql::Builder::new_local(&dir)
        .build()
        .await
        .map_err(TxError::operation)?;
    db.connect()
        .map_err(TxError::operation)?
        .execute(
            "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, email TEXT NOT NULL UNIQUE)",
            (),
        )
        .await
        .map_err(TxError::operation)?;
    let db = Arc::new(db);

    let registry = Arc::new(DataSourceRegistry::new());
    registry.register_default(LibsqlConnectionProvider::new(db.clone()))?;
    let engine = Arc::new(TransactionEngine::new(registry));
    engine.initialize(EngineConfig::default())?;

    // Commit one row; the nested duplicate insert fails and only its savepoint rolls back.
    let e = engine.clone();
    engine
        .run_in_context(&TransactionDefinition::new(Propagation::Required), move |ctx| async move {
            insert(&ctx, "a@example.com").await?;
            let dup = e
                .run_in_context(&TransactionDefinition::new(Propagation::Nested), |inner| async move {
                    insert(&inner, "a@example.com").await
                })
                .await;
            println!("nested duplicate rejected: {}", dup.is_err());
            Ok::<_, TxError>(())
        })
        .await?;

    // Rollback: the error escapes and nothing is written.
    let rolled_back = engine
        .run_in_context(&TransactionDefinition::default(), |ctx| async move {
            insert(&ctx, "b@example.com").await?;
            Err::<(), _>(TxError::configuration("changed my mind"))
        })
        .await;
    println!("second transaction rolled back: {}", rolled_back.is_err());

    let conn = db.connect().map_err(TxError::operation)?;
    let mut rows = conn
        .query("SELECT email FROM users ORDER BY id", ())
        .await
        .map_err(TxError::operation)?;
    while let Some(row) = rows.next().await.map_err(TxError::operation)? {
        println!("user: {}", row.get::<String>(0).map_err(TxError::operation)?);
    }
    Ok(())
}
