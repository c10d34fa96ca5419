use crate::config::Config;
use crate::connection::Connection;
use crate::cursor::{Cursor, LazyRow};
use crate::error::{Error, Result};
use crate::named::{NamedArgs, Placeholder};
use crate::query::{self, Env, ExecResult, Row, SpanGuard, Target};
use crate::scope::Scope;
use crate::trace::Tracer;
use crate::value::Value;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyConnection, Connection as _, Executor as _, Transaction};
use std::fmt;
use std::ops::DerefMut;
use std::sync::Arc;
use tracing::Instrument;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Options applied when a transaction begins.
///
/// The default is the backend's default isolation level, read-write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
    /// PostgreSQL only; ignored elsewhere.
    pub deferrable: bool,
}

impl TxOptions {
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn deferrable(mut self) -> Self {
        self.deferrable = true;
        self
    }

    /// `SET TRANSACTION ...` for `system`, or `None` if there is nothing to set.
    pub(crate) fn set_statement(&self, system: &str) -> Option<String> {
        let mut modes = Vec::new();
        if let Some(level) = self.isolation {
            modes.push(format!("ISOLATION LEVEL {}", level.as_sql()));
        }
        if self.read_only {
            modes.push("READ ONLY".to_string());
        }
        if self.deferrable && system == "postgresql" {
            modes.push("DEFERRABLE".to_string());
        }
        if modes.is_empty() {
            None
        } else {
            Some(format!("SET TRANSACTION {}", modes.join(", ")))
        }
    }
}

/// Transaction handle with the same query operations as [`Connection`].
///
/// A `Tx` is either active or terminal (committed or rolled back). Queries on a
/// terminal `Tx` return [`Error::AlreadyConsumed`]; [`Tx::rollback`] on a terminal
/// `Tx` is a no-op. If a `Tx` is dropped while active, SQLx rolls the transaction
/// back when the connection is next used.
///
/// Usually obtained through [`Connection::run_in_transaction`]. For manual control:
///
/// ```rust,no_run
/// use sqlx_scoped_tx::{args, Connection, Scope, Tx, TxOptions};
///
/// # async fn example(conn: &Connection) -> sqlx_scoped_tx::Result<()> {
/// let scope = Scope::background();
/// let mut pooled = conn.acquire_for_tx().await?;
/// let mut tx = Tx::begin(&mut pooled, conn, &scope, TxOptions::default()).await?;
///
/// tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Eve"]).await?;
///
/// // Explicitly commit
/// tx.commit().await?;
/// # Ok(())
/// # }
/// ```
pub struct Tx<'c> {
    tx: Option<Transaction<'c, Any>>,
    config: Config,
    placeholder: Placeholder,
    tracer: Arc<dyn Tracer>,
    scope: Scope,
    savepoints: usize,
}

impl<'c> Tx<'c> {
    /// Begins a transaction on `conn` using the settings of `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Begin`] if the transaction cannot be started or its options
    /// cannot be applied; no transaction is left open in that case.
    pub async fn begin(
        conn: &'c mut PoolConnection<Any>,
        owner: &Connection,
        scope: &Scope,
        options: TxOptions,
    ) -> Result<Tx<'c>> {
        let config = owner.config().clone();
        let tracer = Arc::clone(owner.tracer());
        let system = config.trace.system.clone();
        let set = options.set_statement(&system);

        let mut span = SpanGuard::new(tracer.start(scope, "begin", set.as_deref().unwrap_or("BEGIN")));
        let (op_scope, release) = scope.with_timeout(config.timeout);

        let sys = system.as_str();
        let set_stmt = set.as_deref();
        let begun = op_scope
            .run(
                async move {
                    let conn: &'c mut AnyConnection = conn.deref_mut();
                    if let (Some(stmt), "mysql") = (set_stmt, sys) {
                        // MySQL only accepts characteristics before the transaction starts
                        (&mut *conn).execute(stmt).await.map_err(Error::Begin)?;
                    }
                    let mut tx = conn.begin().await.map_err(Error::Begin)?;
                    match (set_stmt, sys) {
                        (Some(stmt), "postgresql") => {
                            (&mut *tx).execute(stmt).await.map_err(Error::Begin)?;
                        }
                        (Some(_), "mysql") | (None, _) => {}
                        (Some(_), _) => {
                            tracing::debug!(db.system = sys, ?options, "transaction options ignored");
                        }
                    }
                    Ok(tx)
                }
                .instrument(span.span()),
            )
            .await;
        release.release();

        match begun {
            Ok(tx) => {
                tracing::debug!(db.system = %system, ?options, "transaction started");
                Ok(Tx {
                    tx: Some(tx),
                    placeholder: owner.placeholder(),
                    config,
                    tracer,
                    scope: scope.clone(),
                    savepoints: 0,
                })
            }
            Err(e) => {
                span.record(&e);
                Err(e)
            }
        }
    }

    /// The scope the transaction was started under.
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    /// True until the transaction is committed or rolled back.
    pub fn is_active(&self) -> bool {
        self.tx.is_some()
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyConsumed`] if the transaction is already terminal and
    /// [`Error::Commit`] if the driver fails; the transaction is terminal afterwards
    /// either way.
    pub async fn commit(&mut self) -> Result<()> {
        let tx = self.tx.take().ok_or(Error::AlreadyConsumed)?;
        let mut span = SpanGuard::new(self.tracer.start(&self.scope, "commit", "COMMIT"));
        match tx.commit().instrument(span.span()).await {
            Ok(()) => {
                tracing::debug!("transaction committed");
                Ok(())
            }
            Err(e) => {
                let err = Error::Commit(e);
                span.record(&err);
                Err(err)
            }
        }
    }

    /// Rolls the transaction back. A terminal transaction, or one the driver reports
    /// as already closed, counts as rolled back.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Rollback`] if the driver fails to roll back.
    pub async fn rollback(&mut self) -> Result<()> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        let mut span = SpanGuard::new(self.tracer.start(&self.scope, "rollback", "ROLLBACK"));
        match tx.rollback().instrument(span.span()).await {
            Ok(()) => {
                tracing::debug!("transaction rolled back");
                Ok(())
            }
            Err(e) if is_already_closed(&e) => {
                tracing::debug!(error = %e, "transaction already closed");
                Ok(())
            }
            Err(e) => {
                let err = Error::Rollback(e);
                span.record(&err);
                Err(err)
            }
        }
    }

    /// Returns the underlying connection for use as an SQLx `Executor`.
    ///
    /// Statements issued this way join the transaction but bypass the timeout
    /// and tracing of the query methods.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyConsumed`] if the transaction is terminal.
    pub fn as_executor(&mut self) -> Result<&mut AnyConnection> {
        self.tx
            .as_mut()
            .map(|tx| tx.deref_mut())
            .ok_or(Error::AlreadyConsumed)
    }

    fn parts(&mut self) -> Result<(Env<'_>, Target<'_>)> {
        let Tx {
            tx,
            config,
            placeholder,
            tracer,
            ..
        } = self;
        let conn = tx.as_mut().ok_or(Error::AlreadyConsumed)?.deref_mut();
        let env = Env {
            config,
            tracer: &**tracer,
            placeholder: *placeholder,
        };
        Ok((env, Target::Conn(conn)))
    }

    /// Runs a parameterless control statement such as `SAVEPOINT sp_1`.
    pub(crate) async fn control(&mut self, stmt: &str) -> Result<()> {
        let Tx {
            tx,
            config,
            tracer,
            scope,
            ..
        } = self;
        let conn = tx.as_mut().ok_or(Error::AlreadyConsumed)?.deref_mut();
        let (op_scope, release) = scope.with_timeout(config.timeout);
        let mut span = SpanGuard::new(tracer.start(&op_scope, "savepoint", stmt));

        let res = op_scope
            .run(
                async move {
                    conn.execute(stmt)
                        .await
                        .map(|_| ())
                        .map_err(|e| query::wrap("savepoint", stmt, e))
                }
                .instrument(span.span()),
            )
            .await;
        if let Err(e) = &res {
            span.record(e);
        }
        release.release();
        res
    }

    pub(crate) fn next_savepoint(&mut self) -> String {
        self.savepoints += 1;
        format!("sp_{}", self.savepoints)
    }

    pub(crate) fn pop_savepoint(&mut self) {
        self.savepoints = self.savepoints.saturating_sub(1);
    }

    /// Fetches exactly one row; "no rows" is returned unwrapped.
    pub async fn fetch_one<T: Row>(&mut self, scope: &Scope, stmt: &str, args: &[Value]) -> Result<T> {
        let (env, target) = self.parts()?;
        query::fetch_one(env, target, scope, stmt, args).await
    }

    pub async fn fetch_optional<T: Row>(
        &mut self,
        scope: &Scope,
        stmt: &str,
        args: &[Value],
    ) -> Result<Option<T>> {
        let (env, target) = self.parts()?;
        query::fetch_optional(env, target, scope, stmt, args).await
    }

    pub async fn fetch_all<T: Row>(&mut self, scope: &Scope, stmt: &str, args: &[Value]) -> Result<Vec<T>> {
        let (env, target) = self.parts()?;
        query::fetch_all(env, target, scope, stmt, args).await
    }

    pub async fn exec(&mut self, scope: &Scope, stmt: &str, args: &[Value]) -> Result<ExecResult> {
        let (env, target) = self.parts()?;
        query::exec(env, target, scope, stmt, args).await
    }

    /// Opens a streaming cursor inside the transaction. The transaction stays
    /// borrowed until the cursor is dropped.
    pub async fn open_cursor<'a, T: Row + 'a>(
        &'a mut self,
        scope: &Scope,
        stmt: &'a str,
        args: &[Value],
    ) -> Result<Cursor<'a, T>> {
        let (env, target) = self.parts()?;
        query::open_cursor(env, target, scope, stmt, args).await
    }

    /// Returns a row handle whose statement runs on fetch, under `scope` and
    /// without the configured timeout.
    pub fn open_row<'a>(&'a mut self, scope: &Scope, stmt: &'a str, args: &[Value]) -> LazyRow<'a> {
        let Tx {
            tx,
            config,
            placeholder,
            tracer,
            ..
        } = self;
        let env = Env {
            config,
            tracer: &**tracer,
            placeholder: *placeholder,
        };
        let target = tx.as_mut().map(|tx| Target::Conn(tx.deref_mut()));
        query::open_row(env, target, scope, stmt, args.to_vec())
    }

    pub async fn fetch_one_named<T: Row>(
        &mut self,
        scope: &Scope,
        stmt: &str,
        args: &NamedArgs,
    ) -> Result<T> {
        let (sql, values) = args.bind(stmt, self.placeholder)?;
        self.fetch_one(scope, &sql, &values).await
    }

    pub async fn fetch_all_named<T: Row>(
        &mut self,
        scope: &Scope,
        stmt: &str,
        args: &NamedArgs,
    ) -> Result<Vec<T>> {
        let (sql, values) = args.bind(stmt, self.placeholder)?;
        self.fetch_all(scope, &sql, &values).await
    }

    pub async fn exec_named(&mut self, scope: &Scope, stmt: &str, args: &NamedArgs) -> Result<ExecResult> {
        let (sql, values) = args.bind(stmt, self.placeholder)?;
        self.exec(scope, &sql, &values).await
    }
}

impl fmt::Debug for Tx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx")
            .field("active", &self.is_active())
            .field("savepoints", &self.savepoints)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Driver errors meaning there is no open transaction left to roll back.
pub(crate) fn is_already_closed(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("no transaction is active")
                || msg.contains("no transaction in progress")
                || msg.contains("already been committed or rolled back")
        }
        _ => false,
    }
}
