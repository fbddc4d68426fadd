//! Concurrent bank transfers against one SQLite database.
//!
//! Every transfer takes the database write lock when its unit of work
//! begins. Transfers that find the lock taken fail with `SQLITE_BUSY`, are
//! classified as transient and retried with exponential backoff in a fresh
//! unit of work. The total balance never changes.
//!
//! Run with:
//!
//! ```sh
//! cargo run --example bank_transfer
//! ```

use std::time::Duration;

use txretry::sqlite::{BeginMode, SqliteProvisioner, SqliteUnitOfWorkFactory};
use txretry::{
    AttemptError, CoordinatorError, DatabaseProvisioner, RetryExecutor, RetryPolicy,
    SeedingOptions,
};

const SCHEMA: &str = "
    CREATE TABLE accounts (
        owner   TEXT PRIMARY KEY,
        balance INTEGER NOT NULL CHECK (balance >= 0)
    );
    INSERT INTO accounts VALUES ('alice', 500), ('bob', 500), ('carol', 500);
";

const OWNERS: [&str; 3] = ["alice", "bob", "carol"];

#[derive(Debug, thiserror::Error)]
#[error("{owner} cannot cover {amount}")]
struct InsufficientFunds {
    owner: String,
    amount: i64,
}

async fn transfer(
    executor: &RetryExecutor<SqliteUnitOfWorkFactory>,
    from: &'static str,
    to: &'static str,
    amount: i64,
) -> Result<(), CoordinatorError> {
    executor
        .execute(move |uow| {
            Box::pin(async move {
                let balance: i64 = uow.query_row(
                    "SELECT balance FROM accounts WHERE owner = ?1",
                    [from],
                    |row| row.get(0),
                )?;
                if balance < amount {
                    return Err(AttemptError::application(InsufficientFunds {
                        owner: from.to_string(),
                        amount,
                    }));
                }
                // Give other transfers a chance to collide with this one.
                tokio::time::sleep(Duration::from_millis(2)).await;
                uow.execute(
                    "UPDATE accounts SET balance = balance - ?1 WHERE owner = ?2",
                    rusqlite::params![amount, from],
                )?;
                uow.execute(
                    "UPDATE accounts SET balance = balance + ?1 WHERE owner = ?2",
                    rusqlite::params![amount, to],
                )?;
                Ok(())
            })
        })
        .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let provisioner = SqliteProvisioner::new()?;
    let db = provisioner
        .acquire(SeedingOptions::with_seed_script(SCHEMA))
        .await?;

    let factory = SqliteUnitOfWorkFactory::new(db.connection_string())
        .with_begin_mode(BeginMode::Immediate);
    let policy = RetryPolicy::exponential(Duration::from_millis(5))
        .with_max_attempts(20)
        .with_max_delay(Duration::from_millis(200));
    let executor = RetryExecutor::new(factory, policy);

    let transfers = (0..12).map(|i| {
        let executor = &executor;
        let from = OWNERS[i % 3];
        let to = OWNERS[(i + 1) % 3];
        async move { (from, to, transfer(executor, from, to, 25).await) }
    });

    for (from, to, result) in futures::future::join_all(transfers).await {
        match result {
            Ok(()) => println!("{from} -> {to}: ok"),
            Err(err) => println!("{from} -> {to}: {err}"),
        }
    }

    let conn = rusqlite::Connection::open(db.connection_string())?;
    let total: i64 = conn.query_row("SELECT SUM(balance) FROM accounts", [], |row| row.get(0))?;
    println!("total balance: {total}");
    drop(conn);

    provisioner.release(db).await?;
    Ok(())
}
