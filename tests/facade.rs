mod common;

use common::{connect, connect_traced, count_users};
use serde::Serialize;
use sqlx_scoped_tx::{args, Error, NamedArgs, Result, Scope, TxOptions};
use std::time::Duration;

async fn seed(conn: &sqlx_scoped_tx::Connection) {
    let scope = Scope::background();
    for (name, age) in [("Ann", 31), ("Ben", 42), ("Cat", 27)] {
        conn.exec(&scope, "INSERT INTO users (name, age) VALUES (?, ?)", &args![name, age])
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn fetch_one_not_found_is_unwrapped() {
    let (conn, tracer) = connect_traced().await;
    let scope = Scope::background();

    let err = conn
        .fetch_one::<(String,)>(&scope, "SELECT name FROM users WHERE id = ?", &args![99])
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(matches!(err.as_sqlx(), Some(sqlx::Error::RowNotFound)));

    let spans = tracer.by_operation("get");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].ends, 1);
}

#[tokio::test]
async fn fetch_optional_and_fetch_all() {
    let conn = connect().await;
    let scope = Scope::background();

    let none: Option<(String,)> = conn
        .fetch_optional(&scope, "SELECT name FROM users WHERE id = ?", &args![1])
        .await
        .unwrap();
    assert!(none.is_none());

    let empty: Vec<(String,)> = conn
        .fetch_all(&scope, "SELECT name FROM users", &[])
        .await
        .unwrap();
    assert!(empty.is_empty());

    seed(&conn).await;
    let names: Vec<(String, i64)> = conn
        .fetch_all(&scope, "SELECT name, age FROM users WHERE age > ? ORDER BY id", &args![30])
        .await
        .unwrap();
    assert_eq!(names, vec![("Ann".to_string(), 31), ("Ben".to_string(), 42)]);
}

#[tokio::test]
async fn exec_reports_rows_affected() {
    let conn = connect().await;
    let scope = Scope::background();
    seed(&conn).await;

    let res = conn
        .exec(&scope, "UPDATE users SET age = age + 1 WHERE age < ?", &args![40])
        .await
        .unwrap();
    assert_eq!(res.rows_affected, 2);
}

#[tokio::test]
async fn driver_errors_carry_operation_and_statement() {
    let (conn, tracer) = connect_traced().await;
    let scope = Scope::background();

    let err = conn
        .fetch_all::<(i64,)>(&scope, "SELECT id FROM nope", &[])
        .await
        .unwrap_err();
    match &err {
        Error::Query { op, statement, .. } => {
            assert_eq!(*op, "select");
            assert_eq!(statement, "SELECT id FROM nope");
        }
        other => panic!("unexpected error: {other}"),
    }

    let spans = tracer.by_operation("select");
    assert_eq!(spans[0].errors, vec![err.to_string()]);
    assert_eq!(spans[0].ends, 1);
}

#[tokio::test]
async fn cursor_streams_and_closes_once() {
    let (conn, tracer) = connect_traced().await;
    let scope = Scope::background();
    seed(&conn).await;

    let mut cursor = conn
        .open_cursor::<(String,)>(&scope, "SELECT name FROM users ORDER BY id", &[])
        .await
        .unwrap();
    let mut names = Vec::new();
    while let Some(row) = cursor.next().await {
        names.push(row.unwrap().0);
    }
    assert_eq!(names, ["Ann", "Ben", "Cat"]);

    assert!(cursor.close().is_ok());
    assert!(cursor.close().is_ok());
    assert!(cursor.is_closed());
    assert!(cursor.next().await.is_none());
    drop(cursor);

    let spans = tracer.by_operation("cursor");
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].ends, 1);

    // the pooled connection is free again
    assert_eq!(count_users(&conn).await, 3);
}

#[tokio::test]
async fn cursor_open_error_surfaces_from_open() {
    let (conn, tracer) = connect_traced().await;
    let scope = Scope::background();

    let err = conn
        .open_cursor::<(i64,)>(&scope, "SELECT id FROM nope", &[])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Query { op: "cursor", .. }));

    let spans = tracer.by_operation("cursor");
    assert_eq!(spans[0].errors.len(), 1);
    assert_eq!(spans[0].ends, 1);
}

#[tokio::test]
async fn cursor_try_collect_in_transaction() {
    let conn = connect().await;
    let scope = Scope::background();
    seed(&conn).await;

    let ages: Vec<(i64,)> = conn
        .run_in_transaction(&scope, TxOptions::default(), |tx| {
            Box::pin(async move {
                let scope = tx.scope().clone();
                let cursor = tx
                    .open_cursor::<(i64,)>(&scope, "SELECT age FROM users ORDER BY age", &[])
                    .await?;
                cursor.try_collect().await
            })
        })
        .await
        .unwrap();
    assert_eq!(ages, vec![(27,), (31,), (42,)]);
}

#[tokio::test]
async fn open_row_defers_execution() {
    let (conn, tracer) = connect_traced().await;
    let scope = Scope::background();

    let row = conn.open_row(&scope, "SELECT name FROM users WHERE age = ?", &args![50]);
    assert!(tracer.by_operation("exec").is_empty());

    conn.exec(&scope, "INSERT INTO users (name, age) VALUES (?, ?)", &args!["Dan", 50])
        .await
        .unwrap();
    let (name,): (String,) = row.fetch().await.unwrap();
    assert_eq!(name, "Dan");

    let missing = conn
        .open_row(&scope, "SELECT name FROM users WHERE age = ?", &args![51])
        .fetch::<(String,)>()
        .await
        .unwrap_err();
    assert!(missing.is_not_found());

    let spans = tracer.by_operation("row");
    assert_eq!(spans.len(), 2);
    assert!(spans.iter().all(|s| s.ends == 1));
}

#[tokio::test]
async fn open_row_on_finished_transaction_is_consumed() {
    let conn = connect().await;
    let scope = Scope::background();

    let res: Result<Option<(i64,)>> = conn
        .run_in_transaction(&scope, TxOptions::default(), |tx| {
            Box::pin(async move {
                tx.commit().await?;
                let scope = tx.scope().clone();
                tx.open_row(&scope, "SELECT 1", &[]).fetch_optional().await
            })
        })
        .await;
    assert!(matches!(res, Err(Error::AlreadyConsumed)));
}

#[tokio::test]
async fn cancelled_scope_short_circuits() {
    let (conn, tracer) = connect_traced().await;
    let (scope, release) = Scope::background().with_cancel();
    release.release();

    let err = conn
        .exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Eve"])
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Cancelled));

    let spans = tracer.by_operation("exec");
    assert_eq!(spans[0].errors.len(), 1);
    assert_eq!(spans[0].ends, 1);
    assert_eq!(count_users(&conn).await, 0);
}

#[tokio::test]
async fn expired_scope_reports_deadline() {
    let conn = connect().await;
    let (scope, _release) = Scope::background().with_timeout(Duration::from_millis(1));
    tokio::time::sleep(Duration::from_millis(5)).await;

    let err = conn
        .fetch_all::<(i64,)>(&scope, "SELECT id FROM users", &[])
        .await
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn named_parameters_bind_by_name() {
    let conn = connect().await;
    let scope = Scope::background();

    let args = NamedArgs::new().set("name", "Fay").set("age", 33);
    conn.exec_named(&scope, "INSERT INTO users (name, age) VALUES (:name, :age)", &args)
        .await
        .unwrap();

    #[derive(Serialize)]
    struct Filter<'a> {
        name: &'a str,
    }
    let filter = NamedArgs::from_serialize(&Filter { name: "Fay" }).unwrap();
    let (age,): (i64,) = conn
        .fetch_one_named(&scope, "SELECT age FROM users WHERE name = :name", &filter)
        .await
        .unwrap();
    assert_eq!(age, 33);

    let rows: Vec<(String,)> = conn
        .fetch_all_named(
            &scope,
            "SELECT name FROM users WHERE age >= :age AND name <> ':age'",
            &NamedArgs::new().set("age", 30),
        )
        .await
        .unwrap();
    assert_eq!(rows, vec![("Fay".to_string(),)]);

    let err = conn
        .exec_named(&scope, "DELETE FROM users WHERE id = :id", &NamedArgs::new())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NamedParameter(_)));
}

#[tokio::test]
async fn named_parameters_inside_transaction() {
    let conn = connect().await;
    let scope = Scope::background();

    let res: Result<i64> = conn
        .run_in_transaction(&scope, TxOptions::default(), |tx| {
            Box::pin(async move {
                let scope = tx.scope().clone();
                let args = NamedArgs::new().set("name", "Gus").set("age", 60);
                tx.exec_named(&scope, "INSERT INTO users (name, age) VALUES (:name, :age)", &args)
                    .await?;
                let (age,): (i64,) = tx
                    .fetch_one_named(&scope, "SELECT age FROM users WHERE name = :name", &args)
                    .await?;
                Ok(age)
            })
        })
        .await;
    assert_eq!(res.unwrap(), 60);
}

#[tokio::test]
async fn absent_optional_fields_insert_as_null() {
    let conn = connect().await;
    let scope = Scope::background();

    #[derive(Serialize)]
    struct NewUser<'a> {
        name: &'a str,
        age: Option<i64>,
    }
    let args = NamedArgs::from_serialize(&NewUser { name: "Hal", age: None }).unwrap();
    conn.exec_named(&scope, "INSERT INTO users (name, age) VALUES (:name, :age)", &args)
        .await
        .unwrap();

    conn.exec(
        &scope,
        "INSERT INTO users (name, age) VALUES (?, ?)",
        &args!["Ida", None::<i64>],
    )
    .await
    .unwrap();

    let rows: Vec<(String, Option<i64>)> = conn
        .fetch_all(&scope, "SELECT name, age FROM users ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(
        rows,
        vec![("Hal".to_string(), None), ("Ida".to_string(), None)]
    );
}
