use sqlx_scoped_tx::prelude::*;

const SCHEMA: [&str; 2] = [
    "CREATE TABLE IF NOT EXISTS users (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT NOT NULL)",
    "CREATE TABLE IF NOT EXISTS audit_log (user_id INTEGER NOT NULL, action TEXT NOT NULL)",
];

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Config::from_env()
        .unwrap_or_else(|_| Config::new("sqlite::memory:").with_max_connections(1));
    let conn = Connection::connect(config).await?;
    let scope = Scope::background();
    for stmt in SCHEMA {
        conn.exec(&scope, stmt, &[]).await?;
    }

    println!("=== Nested Transaction (Savepoint) Example ===\n");

    // Example 1: Successful nested transaction
    println!("1. Nested transaction - both succeed...");
    conn.run_in_transaction(&scope, TxOptions::default(), |tx| {
        Box::pin(async move {
            let scope = tx.scope().clone();
            tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["David"])
                .await?;
            let (user_id,): (i64,) = tx
                .fetch_one(&scope, "SELECT id FROM users WHERE name = ?", &args!["David"])
                .await?;
            println!("   Outer: Created user with ID {}", user_id);

            with_nested_transaction(tx, |nested_tx| {
                Box::pin(async move {
                    let scope = nested_tx.scope().clone();
                    nested_tx
                        .exec(
                            &scope,
                            "INSERT INTO audit_log (user_id, action) VALUES (?, ?)",
                            &args![user_id, "User created"],
                        )
                        .await?;
                    println!("   Nested: Created audit log");
                    Ok(())
                })
            })
            .await?;

            println!("   ✓ Both transactions committed\n");
            Ok(())
        })
    })
    .await?;

    // Example 2: Nested transaction fails, outer succeeds
    println!("2. Nested transaction fails, outer succeeds...");
    conn.run_in_transaction(&scope, TxOptions::default(), |tx| {
        Box::pin(async move {
            let scope = tx.scope().clone();
            tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Eve"])
                .await?;

            let nested_result = with_nested_transaction(tx, |nested_tx| {
                Box::pin(async move {
                    let scope = nested_tx.scope().clone();
                    // This will fail
                    nested_tx
                        .exec(&scope, "INSERT INTO non_existent_table VALUES (?)", &args![1])
                        .await?;
                    Ok(())
                })
            })
            .await;

            match nested_result {
                Ok(_) => println!("   ✗ Nested should have failed!"),
                Err(e) => println!("   Nested: Failed ({})", e),
            }

            println!("   ✓ Outer transaction committed (user created)\n");
            Ok(())
        })
    })
    .await?;

    let users: Vec<(String,)> = conn
        .fetch_all(&scope, "SELECT name FROM users ORDER BY id", &[])
        .await?;
    println!("Users: {:?}", users);

    println!("=== All nested transaction examples completed ===");

    conn.close().await;
    Ok(())
}
