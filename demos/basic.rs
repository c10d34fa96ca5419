use sqlx_scoped_tx::prelude::*;
use std::time::Duration;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT NOT NULL
)";

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Defaults to an in-memory SQLite database; the schema below is SQLite syntax
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(_) => Config::new("sqlite::memory:").with_max_connections(1),
    }
    .with_timeout(Duration::from_secs(5));
    let conn = Connection::connect(config).await?;
    let scope = Scope::background();

    conn.exec(&scope, SCHEMA, &[]).await?;

    println!("=== Basic Transaction Example ===\n");

    // Example 1: Simple INSERT
    println!("1. Creating a user...");
    conn.run_in_transaction(&scope, TxOptions::default(), |tx| {
        Box::pin(async move {
            let scope = tx.scope().clone();
            tx.exec(
                &scope,
                "INSERT INTO users (name, email) VALUES (?, ?)",
                &args!["Alice", "alice@example.com"],
            )
            .await?;
            Ok(())
        })
    })
    .await?;
    println!("   ✓ User created successfully\n");

    // Example 2: Named parameters, value returned from the transaction
    println!("2. Creating a user with named parameters...");
    let user_id = conn
        .run_in_transaction(&scope, TxOptions::default(), |tx| {
            Box::pin(async move {
                let scope = tx.scope().clone();
                let args = NamedArgs::new()
                    .set("name", "Bob")
                    .set("email", "bob@example.com");
                tx.exec_named(
                    &scope,
                    "INSERT INTO users (name, email) VALUES (:name, :email)",
                    &args,
                )
                .await?;

                let (id,): (i64,) = tx
                    .fetch_one(&scope, "SELECT id FROM users WHERE name = ?", &args!["Bob"])
                    .await?;
                Ok(id)
            })
        })
        .await?;
    println!("   ✓ User created with ID: {}\n", user_id);

    // Example 3: Error handling and automatic rollback
    println!("3. Testing automatic rollback on error...");
    let result: Result<()> = conn
        .run_in_transaction(&scope, TxOptions::default(), |tx| {
            Box::pin(async move {
                let scope = tx.scope().clone();
                tx.exec(
                    &scope,
                    "INSERT INTO users (name, email) VALUES (?, ?)",
                    &args!["Charlie", "charlie@example.com"],
                )
                .await?;

                // This will cause an error
                tx.exec(&scope, "SELECT * FROM non_existent_table", &[])
                    .await?;
                Ok(())
            })
        })
        .await;

    match result {
        Ok(_) => println!("   ✗ Should have failed!"),
        Err(e) => println!("   ✓ Transaction rolled back: {}\n", e),
    }

    // Example 4: Not found is a normal signal
    println!("4. Looking up the rolled-back user...");
    match conn
        .fetch_one::<(i64,)>(&scope, "SELECT id FROM users WHERE name = ?", &args!["Charlie"])
        .await
    {
        Err(e) if e.is_not_found() => println!("   ✓ Charlie does not exist\n"),
        Err(e) => return Err(e.into()),
        Ok(_) => println!("   ✗ Charlie should not exist!\n"),
    }

    // Example 5: Streaming the table
    println!("5. Streaming users...");
    let mut cursor = conn
        .open_cursor::<(i64, String)>(&scope, "SELECT id, name FROM users ORDER BY id", &[])
        .await?;
    while let Some(row) = cursor.next().await {
        let (id, name) = row?;
        println!("   {}: {}", id, name);
    }
    cursor.close()?;

    println!("\n=== All examples completed successfully ===");

    conn.close().await;
    Ok(())
}
