//! Operation core shared by [`Connection`](crate::Connection) and [`Tx`](crate::Tx).
//!
//! Each operation derives a timeout scope from the caller's scope, opens one span,
//! runs the driver call under both, and on every exit path records the error, ends
//! the span and releases the scope. `sqlx::Error::RowNotFound` is the only driver
//! error returned unwrapped.

use crate::config::Config;
use crate::cursor::{Cursor, LazyRow};
use crate::error::{Error, Result};
use crate::named::{NamedArgs, Placeholder};
use crate::scope::Scope;
use crate::trace::{OpSpan, Tracer};
use crate::value::{to_arguments, Value};
use futures::future::TryFutureExt;
use futures::stream::BoxStream;
use sqlx::any::{AnyQueryResult, AnyRow};
use sqlx::{AnyConnection, AnyPool, FromRow};
use std::future::Future;
use tracing::Instrument;

/// Bound on rows decoded by the façade.
pub trait Row: for<'r> FromRow<'r, AnyRow> + Send + Unpin {}

impl<T> Row for T where T: for<'r> FromRow<'r, AnyRow> + Send + Unpin {}

/// Outcome of a mutating statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Driver-reported last insert id. Only MySQL reports one through the `Any`
    /// driver; PostgreSQL and SQLite give `None`, so use `RETURNING` or a follow-up
    /// query there.
    pub last_insert_id: Option<i64>,
}

impl From<AnyQueryResult> for ExecResult {
    fn from(res: AnyQueryResult) -> Self {
        Self {
            rows_affected: res.rows_affected(),
            last_insert_id: res.last_insert_id(),
        }
    }
}

/// Where statements go: the pool, or the connection of an open transaction.
pub(crate) enum Target<'a> {
    Pool(&'a AnyPool),
    Conn(&'a mut AnyConnection),
}

/// Per-connection settings every operation reads.
#[derive(Clone, Copy)]
pub(crate) struct Env<'a> {
    pub config: &'a Config,
    pub tracer: &'a dyn Tracer,
    pub placeholder: Placeholder,
}

impl Env<'_> {
    pub(crate) fn named(&self, stmt: &str, args: &NamedArgs) -> Result<(String, Vec<Value>)> {
        args.bind(stmt, self.placeholder)
    }
}

/// Ends the wrapped span when dropped.
pub(crate) struct SpanGuard(Box<dyn OpSpan>);

impl SpanGuard {
    pub(crate) fn new(span: Box<dyn OpSpan>) -> Self {
        Self(span)
    }

    pub(crate) fn record(&mut self, err: &Error) {
        self.0.record_error(err);
    }

    pub(crate) fn span(&self) -> tracing::Span {
        self.0.span()
    }
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        self.0.end();
    }
}

/// Wraps a driver error with the operation kind, passing "no rows" through.
pub(crate) fn wrap(op: &'static str, stmt: &str, err: sqlx::Error) -> Error {
    match err {
        sqlx::Error::RowNotFound => Error::Database(err),
        other => Error::query(op, stmt, other),
    }
}

async fn observe<T, F>(env: Env<'_>, scope: &Scope, op: &'static str, stmt: &str, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let (scope, release) = scope.with_timeout(env.config.timeout);
    let mut span = SpanGuard::new(env.tracer.start(&scope, op, stmt));

    let res = scope
        .run(fut.map_err(|e| wrap(op, stmt, e)).instrument(span.span()))
        .await;
    if let Err(e) = &res {
        span.record(e);
    }
    release.release();
    drop(span);
    res
}

pub(crate) async fn fetch_one<T: Row>(
    env: Env<'_>,
    target: Target<'_>,
    scope: &Scope,
    stmt: &str,
    args: &[Value],
) -> Result<T> {
    observe(env, scope, "get", stmt, async move {
        let query = sqlx::query_as_with::<_, T, _>(stmt, to_arguments(args)?);
        match target {
            Target::Pool(pool) => query.fetch_one(pool).await,
            Target::Conn(conn) => query.fetch_one(conn).await,
        }
    })
    .await
}

pub(crate) async fn fetch_optional<T: Row>(
    env: Env<'_>,
    target: Target<'_>,
    scope: &Scope,
    stmt: &str,
    args: &[Value],
) -> Result<Option<T>> {
    observe(env, scope, "select", stmt, async move {
        let query = sqlx::query_as_with::<_, T, _>(stmt, to_arguments(args)?);
        match target {
            Target::Pool(pool) => query.fetch_optional(pool).await,
            Target::Conn(conn) => query.fetch_optional(conn).await,
        }
    })
    .await
}

pub(crate) async fn fetch_all<T: Row>(
    env: Env<'_>,
    target: Target<'_>,
    scope: &Scope,
    stmt: &str,
    args: &[Value],
) -> Result<Vec<T>> {
    observe(env, scope, "select", stmt, async move {
        let query = sqlx::query_as_with::<_, T, _>(stmt, to_arguments(args)?);
        match target {
            Target::Pool(pool) => query.fetch_all(pool).await,
            Target::Conn(conn) => query.fetch_all(conn).await,
        }
    })
    .await
    // an empty result is a normal outcome here, never a sentinel
}

pub(crate) async fn exec(
    env: Env<'_>,
    target: Target<'_>,
    scope: &Scope,
    stmt: &str,
    args: &[Value],
) -> Result<ExecResult> {
    observe(env, scope, "exec", stmt, async move {
        let query = sqlx::query_with(stmt, to_arguments(args)?);
        match target {
            Target::Pool(pool) => query.execute(pool).await,
            Target::Conn(conn) => query.execute(conn).await,
        }
    })
    .await
    .map(ExecResult::from)
}

/// Opens a streaming cursor. The timeout scope and the span stay open until the
/// cursor is closed or dropped.
pub(crate) async fn open_cursor<'a, T: Row + 'a>(
    env: Env<'_>,
    target: Target<'a>,
    scope: &Scope,
    stmt: &'a str,
    args: &[Value],
) -> Result<Cursor<'a, T>> {
    let (scope, release) = scope.with_timeout(env.config.timeout);
    let mut span = SpanGuard::new(env.tracer.start(&scope, "cursor", stmt));

    let args = match to_arguments(args) {
        Ok(args) => args,
        Err(e) => {
            let err = wrap("cursor", stmt, e);
            span.record(&err);
            return Err(err);
        }
    };

    let stream: BoxStream<'a, std::result::Result<T, sqlx::Error>> = match target {
        Target::Pool(pool) => sqlx::query_as_with(stmt, args).fetch(pool),
        Target::Conn(conn) => sqlx::query_as_with(stmt, args).fetch(conn),
    };

    let mut cursor = Cursor::new(stream, stmt, scope, release, span);
    cursor.prime().await?;
    Ok(cursor)
}

/// Defers execution until the row is fetched. Binds no timeout: the statement runs
/// under whatever scope the caller passed in.
pub(crate) fn open_row<'a>(
    env: Env<'a>,
    target: Option<Target<'a>>,
    scope: &Scope,
    stmt: &'a str,
    args: Vec<Value>,
) -> LazyRow<'a> {
    let span = SpanGuard::new(env.tracer.start(scope, "row", stmt));
    LazyRow::new(target, scope.clone(), stmt, args, span)
}

/// Runs a deferred single-row fetch under `scope` without deriving a timeout.
pub(crate) async fn fetch_deferred<T: Row>(
    target: Target<'_>,
    scope: &Scope,
    stmt: &str,
    args: &[Value],
    span: &mut SpanGuard,
) -> Result<Option<T>> {
    let fut = async move {
        let query = sqlx::query_as_with::<_, T, _>(stmt, to_arguments(args)?);
        match target {
            Target::Pool(pool) => query.fetch_optional(pool).await,
            Target::Conn(conn) => query.fetch_optional(conn).await,
        }
    };
    let res = scope
        .run(fut.map_err(|e| wrap("get", stmt, e)).instrument(span.span()))
        .await;
    if let Err(e) = &res {
        span.record(e);
    }
    res
}
