mod common;

use common::{connect, connect_traced, count_users};
use futures::FutureExt;
use sqlx_scoped_tx::{
    args, run_in_transaction, with_nested_transaction, Error, IsolationLevel, Result, Scope,
    TxOptions,
};
use sqlx::Executor;
use std::panic::AssertUnwindSafe;

#[tokio::test]
async fn commits_when_closure_succeeds() {
    let conn = connect().await;
    let scope = Scope::background();

    let affected = conn
        .run_in_transaction(&scope, TxOptions::default(), |tx| {
            Box::pin(async move {
                let scope = tx.scope().clone();
                let res = tx
                    .exec(&scope, "INSERT INTO users (name, age) VALUES (?, ?)", &args!["Alice", 30])
                    .await?;
                tx.exec(&scope, "UPDATE users SET age = age + 1 WHERE name = ?", &args!["Alice"])
                    .await?;
                Ok(res.rows_affected)
            })
        })
        .await
        .unwrap();

    assert_eq!(affected, 1);
    let (age,): (i64,) = conn
        .fetch_one(&scope, "SELECT age FROM users WHERE name = ?", &args!["Alice"])
        .await
        .unwrap();
    assert_eq!(age, 31);
}

#[tokio::test]
async fn rolls_back_and_returns_closure_error() {
    let conn = connect().await;
    let scope = Scope::background();

    let res: Result<()> = conn
        .run_in_transaction(&scope, TxOptions::default(), |tx| {
            Box::pin(async move {
                let scope = tx.scope().clone();
                tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Bob"])
                    .await?;
                Err(Error::custom("boom"))
            })
        })
        .await;

    let err = res.unwrap_err();
    assert!(err.to_string().contains("boom"));
    assert!(matches!(err, Error::Custom(_)));

    let err = conn
        .fetch_one::<(i64,)>(&scope, "SELECT id FROM users WHERE name = ?", &args!["Bob"])
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn failed_statement_rolls_back_earlier_work() {
    let conn = connect().await;
    let scope = Scope::background();

    let res: Result<()> = conn
        .run_in_transaction(&scope, TxOptions::default(), |tx| {
            Box::pin(async move {
                let scope = tx.scope().clone();
                tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Carol"])
                    .await?;
                tx.exec(&scope, "INSERT INTO missing_table VALUES (?)", &args![1])
                    .await?;
                Ok(())
            })
        })
        .await;

    match res.unwrap_err() {
        Error::Query { op, statement, .. } => {
            assert_eq!(op, "exec");
            assert!(statement.contains("missing_table"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(count_users(&conn).await, 0);
}

#[tokio::test]
async fn panic_rolls_back_and_keeps_payload() {
    let conn = connect().await;
    let scope = Scope::background();

    let outcome = AssertUnwindSafe(conn.run_in_transaction::<_, ()>(
        &scope,
        TxOptions::default(),
        |tx| {
            Box::pin(async move {
                let scope = tx.scope().clone();
                tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Dave"])
                    .await?;
                panic!("x")
            })
        },
    ))
    .catch_unwind()
    .await;

    let payload = outcome.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"x"));

    // the connection went back to the pool and the insert is gone
    assert_eq!(count_users(&conn).await, 0);
}

#[tokio::test]
async fn closure_may_finish_the_transaction_itself() {
    let conn = connect().await;
    let scope = Scope::background();

    conn.run_in_transaction(&scope, TxOptions::default(), |tx| {
        Box::pin(async move {
            let scope = tx.scope().clone();
            tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Erin"])
                .await?;
            tx.commit().await?;
            assert!(!tx.is_active());
            Ok(())
        })
    })
    .await
    .unwrap();
    assert_eq!(count_users(&conn).await, 1);

    conn.run_in_transaction(&scope, TxOptions::default(), |tx| {
        Box::pin(async move {
            let scope = tx.scope().clone();
            tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Frank"])
                .await?;
            tx.rollback().await?;
            Ok(())
        })
    })
    .await
    .unwrap();
    assert_eq!(count_users(&conn).await, 1);
}

#[tokio::test]
async fn terminal_transaction_rejects_queries() {
    let conn = connect().await;
    let scope = Scope::background();

    let res: Result<()> = conn
        .run_in_transaction(&scope, TxOptions::default(), |tx| {
            Box::pin(async move {
                tx.rollback().await?;
                // rolling back twice is harmless
                tx.rollback().await?;
                assert!(matches!(tx.commit().await, Err(Error::AlreadyConsumed)));

                let scope = tx.scope().clone();
                tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Gina"])
                    .await?;
                Ok(())
            })
        })
        .await;

    assert!(matches!(res, Err(Error::AlreadyConsumed)));
    assert_eq!(count_users(&conn).await, 0);
}

#[tokio::test]
async fn options_are_accepted_on_sqlite() {
    let conn = connect().await;
    let scope = Scope::background();
    let options = TxOptions::default()
        .isolation(IsolationLevel::Serializable)
        .read_only();

    let names: Vec<(String,)> = run_in_transaction(&conn, &scope, options, |tx| {
        Box::pin(async move {
            let scope = tx.scope().clone();
            tx.fetch_all(&scope, "SELECT name FROM users", &[]).await
        })
    })
    .await
    .unwrap();
    assert!(names.is_empty());
}

#[tokio::test]
async fn nested_failure_keeps_outer_work() {
    let conn = connect().await;
    let scope = Scope::background();

    conn.run_in_transaction(&scope, TxOptions::default(), |tx| {
        Box::pin(async move {
            let scope = tx.scope().clone();
            tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Hank"])
                .await?;

            let nested: Result<()> = with_nested_transaction(tx, |inner| {
                Box::pin(async move {
                    let scope = inner.scope().clone();
                    inner
                        .exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Ivy"])
                        .await?;
                    Err(Error::custom("inner"))
                })
            })
            .await;
            assert!(nested.is_err());
            Ok(())
        })
    })
    .await
    .unwrap();

    let names: Vec<(String,)> = conn
        .fetch_all(&scope, "SELECT name FROM users ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(names, vec![("Hank".to_string(),)]);
}

#[tokio::test]
async fn nested_savepoints_nest() {
    let conn = connect().await;
    let scope = Scope::background();

    conn.run_in_transaction(&scope, TxOptions::default(), |tx| {
        Box::pin(async move {
            with_nested_transaction(tx, |level1| {
                Box::pin(async move {
                    let scope = level1.scope().clone();
                    level1
                        .exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Jack"])
                        .await?;

                    let inner: Result<()> = with_nested_transaction(level1, |level2| {
                        Box::pin(async move {
                            let scope = level2.scope().clone();
                            level2
                                .exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Kim"])
                                .await?;
                            Err(Error::custom("level2"))
                        })
                    })
                    .await;
                    assert!(inner.is_err());
                    Ok(())
                })
            })
            .await
        })
    })
    .await
    .unwrap();

    assert_eq!(count_users(&conn).await, 1);
}

#[tokio::test]
async fn nested_panic_propagates_and_outer_rolls_back() {
    let conn = connect().await;
    let scope = Scope::background();

    let outcome = AssertUnwindSafe(conn.run_in_transaction::<_, ()>(
        &scope,
        TxOptions::default(),
        |tx| {
            Box::pin(async move {
                let scope = tx.scope().clone();
                tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Liam"])
                    .await?;
                with_nested_transaction::<_, ()>(tx, |_inner| Box::pin(async move { panic!("nested") }))
                    .await
            })
        },
    ))
    .catch_unwind()
    .await;

    assert_eq!(outcome.unwrap_err().downcast_ref::<&str>(), Some(&"nested"));
    assert_eq!(count_users(&conn).await, 0);
}

#[tokio::test]
async fn cancelled_scope_fails_before_begin() {
    let (conn, tracer) = connect_traced().await;
    let (scope, release) = Scope::background().with_cancel();
    release.release();

    let res: Result<()> = conn
        .run_in_transaction(&scope, TxOptions::default(), |_tx| {
            Box::pin(async move { panic!("closure must not run") })
        })
        .await;
    assert!(matches!(res, Err(Error::Cancelled)));

    let spans = tracer.by_operation("transaction");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].errors.len(), 1);
    assert_eq!(spans[0].ends, 1);
}

#[tokio::test]
async fn every_span_ends_once() {
    let (conn, tracer) = connect_traced().await;
    tracer.clear();
    let scope = Scope::background();

    let res: Result<()> = conn
        .run_in_transaction(&scope, TxOptions::default(), |tx| {
            Box::pin(async move {
                let scope = tx.scope().clone();
                tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Mia"])
                    .await?;
                let _ = tx
                    .fetch_one::<(i64,)>(&scope, "SELECT id FROM users WHERE name = ?", &args!["nobody"])
                    .await;
                tx.exec(&scope, "INSERT INTO nowhere VALUES (1)", &[]).await?;
                Ok(())
            })
        })
        .await;
    assert!(res.is_err());

    let spans = tracer.spans();
    let ops: Vec<_> = spans.iter().map(|s| s.operation).collect();
    assert_eq!(ops, vec!["transaction", "begin", "exec", "get", "exec", "rollback"]);
    assert!(spans.iter().all(|s| s.ends == 1), "{spans:?}");

    // "no rows" is recorded on its span but is not a failure of the transaction
    assert_eq!(spans[3].errors.len(), 1);
    assert_eq!(spans[4].errors.len(), 1);
    assert_eq!(spans[0].errors.len(), 1);
    assert!(spans[5].errors.is_empty());
}

#[tokio::test]
async fn failed_savepoint_rollback_is_merged_into_the_error() {
    let conn = connect().await;
    let scope = Scope::background();

    conn.run_in_transaction(&scope, TxOptions::default(), |tx| {
        Box::pin(async move {
            let nested: Result<()> = with_nested_transaction(tx, |inner| {
                Box::pin(async move {
                    // drop the savepoint behind the wrapper's back so its rollback fails
                    inner.as_executor()?.execute("RELEASE SAVEPOINT sp_1").await?;
                    Err(Error::custom("boom"))
                })
            })
            .await;

            let err = nested.unwrap_err();
            let msg = err.to_string();
            assert!(matches!(err, Error::RollbackFailed { .. }), "{msg}");
            assert!(msg.contains("boom"), "{msg}");
            assert!(msg.contains("rollback also failed"), "{msg}");
            assert!(msg.contains("ROLLBACK TO SAVEPOINT sp_1"), "{msg}");
            Ok(())
        })
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn failed_release_rolls_back_to_savepoint() {
    let conn = connect().await;
    let scope = Scope::background();

    conn.run_in_transaction(&scope, TxOptions::default(), |tx| {
        Box::pin(async move {
            let nested: Result<()> = with_nested_transaction(tx, |inner| {
                Box::pin(async move {
                    inner.as_executor()?.execute("RELEASE SAVEPOINT sp_1").await?;
                    Ok(())
                })
            })
            .await;

            // the release failed, and the rollback to the savepoint was attempted after it
            match nested.unwrap_err() {
                Error::RollbackFailed { cause, rollback } => {
                    assert!(cause.to_string().contains("RELEASE SAVEPOINT sp_1"));
                    assert!(rollback.to_string().contains("ROLLBACK TO SAVEPOINT sp_1"));
                }
                other => panic!("unexpected error: {other}"),
            }

            // the depth counter is back to zero, so a sibling starts at sp_1 again
            with_nested_transaction(tx, |inner| {
                Box::pin(async move {
                    let scope = inner.scope().clone();
                    inner
                        .exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Nora"])
                        .await?;
                    Ok(())
                })
            })
            .await
        })
    })
    .await
    .unwrap();

    assert_eq!(count_users(&conn).await, 1);
}

#[tokio::test]
async fn nested_panic_survives_failed_savepoint_rollback() {
    let conn = connect().await;
    let scope = Scope::background();

    let outcome = AssertUnwindSafe(conn.run_in_transaction::<_, ()>(
        &scope,
        TxOptions::default(),
        |tx| {
            Box::pin(async move {
                let scope = tx.scope().clone();
                tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Owen"])
                    .await?;
                with_nested_transaction::<_, ()>(tx, |inner| {
                    Box::pin(async move {
                        inner.as_executor()?.execute("RELEASE SAVEPOINT sp_1").await?;
                        panic!("inner")
                    })
                })
                .await
            })
        },
    ))
    .catch_unwind()
    .await;

    assert_eq!(outcome.unwrap_err().downcast_ref::<&str>(), Some(&"inner"));
    assert_eq!(count_users(&conn).await, 0);
}
