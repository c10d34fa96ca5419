use crate::connection::Connection;
use crate::context::{Tx, TxOptions};
use crate::error::{Error, Result};
use crate::query::SpanGuard;
use crate::scope::Scope;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

/// Executes a function within a database transaction.
///
/// This function handles the transaction lifecycle:
/// - Begins a transaction with `options`
/// - Executes the provided function
/// - Commits on success
/// - Rolls back on error, merging a failed rollback into the returned error
/// - Rolls back on panic, then resumes the panic with its original payload
///
/// If the function already committed or rolled back the transaction itself, no
/// further commit is attempted.
///
/// # Type Parameters
///
/// * `F` - A function that takes a mutable `Tx` and returns a pinned future
/// * `T` - The return type of the function (must be `Send`)
///
/// # Examples
///
/// ## Multiple Operations
///
/// ```rust,no_run
/// use sqlx_scoped_tx::{args, run_in_transaction, Connection, Error, Scope, TxOptions};
///
/// # async fn example(conn: &Connection) -> sqlx_scoped_tx::Result<()> {
/// let scope = Scope::background();
/// let user_id = run_in_transaction(conn, &scope, TxOptions::default(), |tx| {
///     Box::pin(async move {
///         let scope = tx.scope().clone();
///         let res = tx
///             .exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Bob"])
///             .await?;
///         // MySQL only; see `ExecResult::last_insert_id`
///         let user_id = res
///             .last_insert_id
///             .ok_or_else(|| Error::custom("no insert id reported"))?;
///
///         tx.exec(
///             &scope,
///             "INSERT INTO profiles (user_id, bio) VALUES (?, ?)",
///             &args![user_id, "Software Developer"],
///         )
///         .await?;
///
///         Ok(user_id)
///     })
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Error Handling
///
/// ```rust,no_run
/// use sqlx_scoped_tx::{args, run_in_transaction, Connection, Error, Scope, TxOptions};
///
/// # async fn example(conn: &Connection) -> sqlx_scoped_tx::Result<()> {
/// let scope = Scope::background();
/// let result: sqlx_scoped_tx::Result<()> = run_in_transaction(conn, &scope, TxOptions::default(), |tx| {
///     Box::pin(async move {
///         let scope = tx.scope().clone();
///         tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Charlie"])
///             .await?;
///
///         // The insert above is rolled back
///         Err(Error::custom("boom"))
///     })
/// })
/// .await;
///
/// assert!(result.is_err());
/// # Ok(())
/// # }
/// ```
pub async fn run_in_transaction<F, T>(
    conn: &Connection,
    scope: &Scope,
    options: TxOptions,
    f: F,
) -> Result<T>
where
    F: for<'a> FnOnce(&'a mut Tx<'_>) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>,
    T: Send,
{
    let mut span = SpanGuard::new(conn.tracer().start(scope, "transaction", "run_in_transaction"));

    let mut pooled = match scope.run(conn.acquire_for_tx()).await {
        Ok(pooled) => pooled,
        Err(e) => {
            span.record(&e);
            return Err(e);
        }
    };
    let mut tx = match Tx::begin(&mut pooled, conn, scope, options).await {
        Ok(tx) => tx,
        Err(e) => {
            span.record(&e);
            return Err(e);
        }
    };

    let outcome = AssertUnwindSafe(async { f(&mut tx).await })
        .catch_unwind()
        .await;

    match outcome {
        Err(payload) => {
            tracing::error!(panic = %panic_message(&*payload), "transaction closure panicked, rolling back");
            if let Err(rollback) = tx.rollback().await {
                tracing::error!(error = %rollback, "rollback after panic failed");
                span.record(&rollback);
            }
            drop(span);
            std::panic::resume_unwind(payload)
        }
        Ok(Err(cause)) => {
            span.record(&cause);
            match tx.rollback().await {
                Ok(()) => Err(cause),
                Err(rollback) => {
                    tracing::error!(error = %rollback, cause = %cause, "rollback after failure failed");
                    let merged = Error::RollbackFailed {
                        cause: Box::new(cause),
                        rollback: Box::new(rollback),
                    };
                    span.record(&merged);
                    Err(merged)
                }
            }
        }
        Ok(Ok(value)) => {
            if !tx.is_active() {
                tracing::debug!("transaction already finished inside closure");
                return Ok(value);
            }
            match tx.commit().await {
                Ok(()) => Ok(value),
                Err(e) => {
                    span.record(&e);
                    Err(e)
                }
            }
        }
    }
}

/// Executes a nested transaction using savepoints.
///
/// A savepoint is created before `f` runs. If `f` succeeds the savepoint is
/// released; if it fails or panics, only the work since the savepoint is rolled
/// back and the outer transaction stays usable. Savepoints are numbered by depth
/// (`sp_1`, `sp_2`, ...), so nested calls may themselves nest.
///
/// # Examples
///
/// ```rust,no_run
/// use sqlx_scoped_tx::{args, run_in_transaction, with_nested_transaction, Connection, Scope, TxOptions};
///
/// # async fn example(conn: &Connection) -> sqlx_scoped_tx::Result<()> {
/// let scope = Scope::background();
/// run_in_transaction(conn, &scope, TxOptions::default(), |tx| {
///     Box::pin(async move {
///         let scope = tx.scope().clone();
///         tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Alice"])
///             .await?;
///
///         let nested = with_nested_transaction(tx, |nested_tx| {
///             Box::pin(async move {
///                 let scope = nested_tx.scope().clone();
///                 nested_tx
///                     .exec(&scope, "INSERT INTO logs (message) VALUES (?)", &args!["User created"])
///                     .await?;
///                 Ok(())
///             })
///         })
///         .await;
///
///         // If the nested transaction fails, the outer one can still commit
///         if nested.is_err() {
///             println!("Logging failed, but user creation will still commit");
///         }
///         Ok(())
///     })
/// })
/// .await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_nested_transaction<F, T>(tx: &mut Tx<'_>, f: F) -> Result<T>
where
    F: for<'a> FnOnce(&'a mut Tx<'_>) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>,
    T: Send,
{
    let name = tx.next_savepoint();
    if let Err(e) = tx.control(&format!("SAVEPOINT {name}")).await {
        tx.pop_savepoint();
        return Err(e);
    }

    let outcome = AssertUnwindSafe(async { f(&mut *tx).await })
        .catch_unwind()
        .await;

    let rollback_stmt = format!("ROLLBACK TO SAVEPOINT {name}");
    let res = match outcome {
        Err(payload) => {
            tracing::error!(
                savepoint = %name,
                panic = %panic_message(&*payload),
                "nested transaction panicked, rolling back to savepoint"
            );
            if let Err(rollback) = tx.control(&rollback_stmt).await {
                tracing::error!(savepoint = %name, error = %rollback, "rollback to savepoint after panic failed");
            }
            tx.pop_savepoint();
            std::panic::resume_unwind(payload)
        }
        Ok(Ok(value)) => match tx.control(&format!("RELEASE SAVEPOINT {name}")).await {
            Ok(()) => Ok(value),
            // the savepoint may still be open; undo its work before reporting
            Err(release) => rollback_to(tx, &rollback_stmt, release).await,
        },
        Ok(Err(cause)) => rollback_to(tx, &rollback_stmt, cause).await,
    };
    tx.pop_savepoint();
    res
}

async fn rollback_to<T>(tx: &mut Tx<'_>, stmt: &str, cause: Error) -> Result<T> {
    match tx.control(stmt).await {
        Ok(()) => Err(cause),
        Err(rollback) => {
            tracing::error!(error = %rollback, cause = %cause, "rollback to savepoint failed");
            Err(Error::RollbackFailed {
                cause: Box::new(cause),
                rollback: Box::new(rollback),
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_message_reads_common_payloads() {
        let payload: Box<dyn Any + Send> = Box::new("x");
        assert_eq!(panic_message(&*payload), "x");

        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(&*payload), "owned");

        let payload: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }
}
