// Run with:
//   cargo run -p txscope --example transfer
// Moves funds between accounts on the in-memory backend. Every attempt is audited in
// its own REQUIRES_NEW transaction, so the audit row survives a failed transfer,
// and a notification is queued only once the transfer commits.

use std::sync::Arc;

use tests_common::MemoryDatabase;
use txscope::{
    register_on_commit, Propagation, TransactionContext, TransactionDefinition,
    TransactionEngine, TxError, TxResult,
};

fn balance(db: &MemoryDatabase, ctx: &TransactionContext, account: &str) -> i64 {
    db.get(ctx, account)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

async fn audit(engine: &TransactionEngine, db: &MemoryDatabase, entry: String) -> TxResult<()> {
    let db = db.clone();
    engine
        .run_in_context(&TransactionDefinition::new(Propagation::RequiresNew), move |ctx| async move {
            let key = format!("audit:{}", entry);
            db.put(&ctx, &key, "1")
        })
        .await
}

async fn transfer(
    engine: Arc<TransactionEngine>,
    db: MemoryDatabase,
    from: &'static str,
    to: &'static str,
    amount: i64,
) -> TxResult<()> {
    let e = engine.clone();
    engine
        .run_in_context(&TransactionDefinition::new(Propagation::Required), move |ctx| async move {
            audit(&e, &db, format!("{}->{}:{}", from, to, amount)).await?;

            let available = balance(&db, &ctx, from);
            db.put(&ctx, from, &(available - amount).to_string())?;
            db.put(&ctx, to, &(balance(&db, &ctx, to) + amount).to_string())?;
            if available < amount {
                return Err(TxError::application(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("{} has only {}", from, available),
                )));
            }

            register_on_commit(move || async move {
                println!("notify: {} sent {} to {}", from, amount, to);
                Ok::<_, TxError>(())
            })?;
            Ok(())
        })
        .await
}

#[tokio::main]
async fn main() -> TxResult<()> {
    let db = MemoryDatabase::new();
    let engine = db.engine()?;

    // Seed the accounts outside any transaction.
    db.put(&TransactionContext::plain(), "alice", "100")?;
    db.put(&TransactionContext::plain(), "bob", "0")?;

    transfer(engine.clone(), db.clone(), "alice", "bob", 70).await?;
    if let Err(e) = transfer(engine.clone(), db.clone(), "alice", "bob", 70).await {
        println!("second transfer rejected: {}", e);
    }

    for (key, value) in db.committed_rows() {
        println!("{:<24} {}", key, value);
    }
    engine.shutdown();
    Ok(())
}
