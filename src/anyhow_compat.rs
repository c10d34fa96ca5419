use crate::connection::Connection;
use crate::context::{Tx, TxOptions};
use crate::scope::Scope;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

/// Executes a function within a database transaction, using anyhow::Error for error handling.
///
/// This is a convenience wrapper around [`run_in_transaction`](crate::run_in_transaction)
/// that accepts closures returning `anyhow::Result<T>`. When the rollback after a
/// failed closure also fails, the rollback error is attached to the closure's error
/// as context; `{:#}` shows both.
///
/// # Examples
///
/// ```rust,no_run
/// use sqlx_scoped_tx::{args, run_in_transaction_anyhow, Connection, Scope, TxOptions};
///
/// # async fn example(conn: &Connection) -> anyhow::Result<()> {
/// let scope = Scope::background();
/// run_in_transaction_anyhow(conn, &scope, TxOptions::default(), |tx| {
///     Box::pin(async move {
///         let scope = tx.scope().clone();
///         tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Alice"])
///             .await?;
///         Ok(())
///     })
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn run_in_transaction_anyhow<F, T>(
    conn: &Connection,
    scope: &Scope,
    options: TxOptions,
    f: F,
) -> anyhow::Result<T>
where
    F: for<'a> FnOnce(
        &'a mut Tx<'_>,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>,
    T: Send,
{
    let mut pooled = conn.acquire_for_tx().await?;
    let mut tx = Tx::begin(&mut pooled, conn, scope, options).await?;

    let outcome = AssertUnwindSafe(async { f(&mut tx).await })
        .catch_unwind()
        .await;

    match outcome {
        Err(payload) => {
            if let Err(e) = tx.rollback().await {
                tracing::error!(error = %e, "rollback after panic failed");
            }
            std::panic::resume_unwind(payload)
        }
        Ok(Ok(result)) => {
            if tx.is_active() {
                tx.commit().await?;
            }
            Ok(result)
        }
        Ok(Err(e)) => match tx.rollback().await {
            Ok(()) => Err(e),
            Err(rollback) => Err(e.context(format!("rollback also failed: {rollback}"))),
        },
    }
}

/// Executes a nested transaction using savepoints, with anyhow::Error for error handling.
///
/// # Examples
///
/// ```rust,no_run
/// use sqlx_scoped_tx::{args, run_in_transaction_anyhow, with_nested_transaction_anyhow};
/// use sqlx_scoped_tx::{Connection, Scope, TxOptions};
///
/// # async fn example(conn: &Connection) -> anyhow::Result<()> {
/// let scope = Scope::background();
/// run_in_transaction_anyhow(conn, &scope, TxOptions::default(), |tx| {
///     Box::pin(async move {
///         let scope = tx.scope().clone();
///         tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Alice"])
///             .await?;
///
///         with_nested_transaction_anyhow(tx, |nested_tx| {
///             Box::pin(async move {
///                 let scope = nested_tx.scope().clone();
///                 nested_tx
///                     .exec(&scope, "INSERT INTO audit_log (action) VALUES (?)", &args!["User created"])
///                     .await?;
///                 Ok(())
///             })
///         })
///         .await?;
///
///         Ok(())
///     })
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_nested_transaction_anyhow<F, T>(tx: &mut Tx<'_>, f: F) -> anyhow::Result<T>
where
    F: for<'a> FnOnce(&'a mut Tx<'_>) -> Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>,
    T: Send,
{
    let name = tx.next_savepoint();
    if let Err(e) = tx.control(&format!("SAVEPOINT {name}")).await {
        tx.pop_savepoint();
        return Err(e.into());
    }

    let outcome = AssertUnwindSafe(async { f(&mut *tx).await })
        .catch_unwind()
        .await;

    let rollback_stmt = format!("ROLLBACK TO SAVEPOINT {name}");
    let res = match outcome {
        Err(payload) => {
            if let Err(rollback) = tx.control(&rollback_stmt).await {
                tracing::error!(savepoint = %name, error = %rollback, "rollback to savepoint after panic failed");
            }
            tx.pop_savepoint();
            std::panic::resume_unwind(payload)
        }
        Ok(Ok(result)) => match tx.control(&format!("RELEASE SAVEPOINT {name}")).await {
            Ok(()) => Ok(result),
            Err(release) => rollback_to(tx, &rollback_stmt, release.into()).await,
        },
        Ok(Err(e)) => rollback_to(tx, &rollback_stmt, e).await,
    };
    tx.pop_savepoint();
    res
}

async fn rollback_to<T>(tx: &mut Tx<'_>, stmt: &str, cause: anyhow::Error) -> anyhow::Result<T> {
    match tx.control(stmt).await {
        Ok(()) => Err(cause),
        Err(rollback) => Err(cause.context(format!("rollback also failed: {rollback}"))),
    }
}
