//! Lazy result handles.
//!
//! A [`Cursor`] owns its timeout scope and span for its whole lifetime; both are
//! released by [`Cursor::close`], which is idempotent and also runs on drop. A
//! [`LazyRow`] has not executed anything yet; its statement runs when it is fetched.

use crate::error::{Error, Result};
use crate::query::{self, wrap, Row, SpanGuard, Target};
use crate::scope::{Release, Scope};
use crate::value::Value;
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::fmt;

struct State<'a, T> {
    closed: bool,
    stream: Option<BoxStream<'a, std::result::Result<T, sqlx::Error>>>,
    peeked: Option<T>,
    release: Option<Release>,
    span: Option<SpanGuard>,
}

/// Streaming multi-row cursor.
///
/// # Examples
///
/// ```rust,no_run
/// use sqlx_scoped_tx::{args, Connection, Scope};
///
/// # async fn example(conn: &Connection) -> sqlx_scoped_tx::Result<()> {
/// let scope = Scope::background();
/// let mut cursor = conn
///     .open_cursor::<(i64, String)>(&scope, "SELECT id, name FROM users WHERE id > ?", &args![10])
///     .await?;
/// while let Some(row) = cursor.next().await {
///     let (id, name) = row?;
///     println!("{id}: {name}");
/// }
/// cursor.close()?;
/// # Ok(())
/// # }
/// ```
pub struct Cursor<'a, T> {
    state: Mutex<State<'a, T>>,
    scope: Scope,
    statement: String,
}

impl<'a, T: Row> Cursor<'a, T> {
    pub(crate) fn new(
        stream: BoxStream<'a, std::result::Result<T, sqlx::Error>>,
        statement: &str,
        scope: Scope,
        release: Release,
        span: SpanGuard,
    ) -> Self {
        Self {
            state: Mutex::new(State {
                closed: false,
                stream: Some(stream),
                peeked: None,
                release: Some(release),
                span: Some(span),
            }),
            scope,
            statement: statement.to_string(),
        }
    }

    /// Pulls the first row so that errors from executing the statement surface
    /// when the cursor is opened.
    pub(crate) async fn prime(&mut self) -> Result<()> {
        match self.pull().await {
            Some(Ok(row)) => {
                self.state.get_mut().peeked = Some(row);
                Ok(())
            }
            Some(Err(e)) => {
                self.close()?;
                Err(e)
            }
            None => Ok(()),
        }
    }

    async fn pull(&mut self) -> Option<Result<T>> {
        let Self {
            state,
            scope,
            statement,
        } = self;
        let state = state.get_mut();
        if state.closed {
            return None;
        }
        let stream = state.stream.as_mut()?;

        let res = scope
            .run(async {
                stream
                    .next()
                    .await
                    .transpose()
                    .map_err(|e| wrap("cursor", statement, e))
            })
            .await;

        match res {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                state.stream = None;
                None
            }
            Err(e) => {
                if let Some(span) = state.span.as_mut() {
                    span.record(&e);
                }
                Some(Err(e))
            }
        }
    }

    /// Reads the next row. Returns `None` once the rows are exhausted or the
    /// cursor has been closed.
    pub async fn next(&mut self) -> Option<Result<T>> {
        let state = self.state.get_mut();
        if state.closed {
            return None;
        }
        if let Some(row) = state.peeked.take() {
            return Some(Ok(row));
        }
        self.pull().await
    }

    /// Reads every remaining row, then closes the cursor.
    pub async fn try_collect(mut self) -> Result<Vec<T>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next().await {
            rows.push(row?);
        }
        self.close()?;
        Ok(rows)
    }
}

impl<T> Cursor<'_, T> {
    /// Releases the timeout scope, ends the span and drops the driver stream.
    ///
    /// Only the first call does anything; later calls return `Ok(())`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        if let Some(release) = state.release.take() {
            release.release();
        }
        drop(state.span.take());
        state.peeked = None;
        // dropping an sqlx stream cannot fail
        drop(state.stream.take());
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn statement(&self) -> &str {
        &self.statement
    }
}

impl<T> Drop for Cursor<'_, T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl<T> fmt::Debug for Cursor<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("statement", &self.statement)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Single row whose statement has not executed yet.
///
/// Nothing reaches the database until [`LazyRow::fetch`] or
/// [`LazyRow::fetch_optional`] is called. No timeout is derived for it: the
/// statement runs under the scope given to `open_row`, so apply a deadline to that
/// scope if one is wanted.
pub struct LazyRow<'a> {
    target: Option<Target<'a>>,
    scope: Scope,
    statement: &'a str,
    args: Vec<Value>,
    span: SpanGuard,
}

impl<'a> LazyRow<'a> {
    pub(crate) fn new(
        target: Option<Target<'a>>,
        scope: Scope,
        statement: &'a str,
        args: Vec<Value>,
        span: SpanGuard,
    ) -> Self {
        Self {
            target,
            scope,
            statement,
            args,
            span,
        }
    }

    /// Executes the statement and decodes exactly one row.
    ///
    /// Returns the unwrapped `sqlx::Error::RowNotFound` sentinel when no row matches.
    pub async fn fetch<T: Row>(self) -> Result<T> {
        match self.fetch_optional().await? {
            Some(row) => Ok(row),
            None => Err(Error::Database(sqlx::Error::RowNotFound)),
        }
    }

    pub async fn fetch_optional<T: Row>(self) -> Result<Option<T>> {
        let LazyRow {
            target,
            scope,
            statement,
            args,
            mut span,
        } = self;
        let Some(target) = target else {
            span.record(&Error::AlreadyConsumed);
            return Err(Error::AlreadyConsumed);
        };
        query::fetch_deferred(target, &scope, statement, &args, &mut span).await
    }

    pub fn statement(&self) -> &str {
        self.statement
    }
}

impl fmt::Debug for LazyRow<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyRow")
            .field("statement", &self.statement)
            .field("args", &self.args)
            .finish()
    }
}
