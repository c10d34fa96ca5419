use crate::config::Config;
use crate::context::{Tx, TxOptions};
use crate::cursor::{Cursor, LazyRow};
use crate::error::{Error, Result};
use crate::named::{NamedArgs, Placeholder};
use crate::query::{self, Env, ExecResult, Row, Target};
use crate::scope::Scope;
use crate::trace::{Tracer, TracingTracer};
use crate::value::Value;
use sqlx::any::AnyPoolOptions;
use sqlx::pool::PoolConnection;
use sqlx::{Any, AnyPool};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Pool-backed database handle.
///
/// `Connection` is cheap to clone and safe to share between tasks. Every query
/// method runs under the configured per-operation timeout and opens one span
/// through the injected [`Tracer`].
///
/// # Examples
///
/// ```rust,no_run
/// use sqlx_scoped_tx::{args, Config, Connection, Scope};
/// use std::time::Duration;
///
/// # async fn example() -> sqlx_scoped_tx::Result<()> {
/// let config = Config::new("mysql://localhost/test").with_timeout(Duration::from_secs(5));
/// let conn = Connection::connect(config).await?;
///
/// let scope = Scope::background();
/// let (name,): (String,) = conn
///     .fetch_one(&scope, "SELECT name FROM users WHERE id = ?", &args![1])
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    pool: AnyPool,
    config: Config,
    placeholder: Placeholder,
    tracer: Arc<dyn Tracer>,
}

impl Connection {
    /// Opens a pool from `config`, tracing through [`TracingTracer`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid pool bounds and [`Error::Database`] if
    /// the pool cannot connect.
    pub async fn connect(config: Config) -> Result<Self> {
        config.validate()?;
        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await?;

        tracing::debug!(
            db.system = %config.trace.system,
            max_connections = config.max_connections,
            "database pool opened"
        );
        Ok(Self::from_pool(pool, config))
    }

    /// Wraps an existing pool. The pool must have been opened from `config.url`.
    pub fn from_pool(pool: AnyPool, config: Config) -> Self {
        let tracer = Arc::new(TracingTracer::new(config.trace.clone()));
        Self {
            pool,
            placeholder: Placeholder::for_url(&config.url),
            config,
            tracer,
        }
    }

    /// Replaces the tracer used by this handle and the transactions it opens.
    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Closes the pool, waiting for checked-out connections to come back.
    pub async fn close(&self) {
        self.pool.close().await;
        tracing::debug!(db.system = %self.config.trace.system, "database pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    fn env(&self) -> Env<'_> {
        Env {
            config: &self.config,
            tracer: self.tracer.as_ref(),
            placeholder: self.placeholder,
        }
    }

    /// Fetches exactly one row.
    ///
    /// # Errors
    ///
    /// When no row matches, returns `Error::Database(sqlx::Error::RowNotFound)`
    /// unwrapped (see [`Error::is_not_found`]); any other failure is wrapped as
    /// [`Error::Query`].
    pub async fn fetch_one<T: Row>(&self, scope: &Scope, stmt: &str, args: &[Value]) -> Result<T> {
        query::fetch_one(self.env(), Target::Pool(&self.pool), scope, stmt, args).await
    }

    pub async fn fetch_optional<T: Row>(
        &self,
        scope: &Scope,
        stmt: &str,
        args: &[Value],
    ) -> Result<Option<T>> {
        query::fetch_optional(self.env(), Target::Pool(&self.pool), scope, stmt, args).await
    }

    /// Fetches every matching row; an empty result is `Ok(vec![])`.
    pub async fn fetch_all<T: Row>(&self, scope: &Scope, stmt: &str, args: &[Value]) -> Result<Vec<T>> {
        query::fetch_all(self.env(), Target::Pool(&self.pool), scope, stmt, args).await
    }

    pub async fn exec(&self, scope: &Scope, stmt: &str, args: &[Value]) -> Result<ExecResult> {
        query::exec(self.env(), Target::Pool(&self.pool), scope, stmt, args).await
    }

    /// Opens a streaming cursor. The timeout covers the cursor's whole lifetime and
    /// is released when the cursor is closed or dropped.
    pub async fn open_cursor<'a, T: Row + 'a>(
        &'a self,
        scope: &Scope,
        stmt: &'a str,
        args: &[Value],
    ) -> Result<Cursor<'a, T>> {
        query::open_cursor(self.env(), Target::Pool(&self.pool), scope, stmt, args).await
    }

    /// Returns a row handle whose statement runs on fetch, under `scope` and
    /// without the configured timeout.
    pub fn open_row<'a>(&'a self, scope: &Scope, stmt: &'a str, args: &[Value]) -> LazyRow<'a> {
        query::open_row(
            self.env(),
            Some(Target::Pool(&self.pool)),
            scope,
            stmt,
            args.to_vec(),
        )
    }

    /// [`fetch_one`](Self::fetch_one) with `:name` parameters.
    pub async fn fetch_one_named<T: Row>(&self, scope: &Scope, stmt: &str, args: &NamedArgs) -> Result<T> {
        let (sql, values) = self.env().named(stmt, args)?;
        self.fetch_one(scope, &sql, &values).await
    }

    pub async fn fetch_all_named<T: Row>(
        &self,
        scope: &Scope,
        stmt: &str,
        args: &NamedArgs,
    ) -> Result<Vec<T>> {
        let (sql, values) = self.env().named(stmt, args)?;
        self.fetch_all(scope, &sql, &values).await
    }

    pub async fn exec_named(&self, scope: &Scope, stmt: &str, args: &NamedArgs) -> Result<ExecResult> {
        let (sql, values) = self.env().named(stmt, args)?;
        self.exec(scope, &sql, &values).await
    }

    /// Runs `f` inside one transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back when it returns
    /// `Err` or panics. A panic is re-raised with its original payload after the
    /// rollback. See [`run_in_transaction`](crate::run_in_transaction).
    ///
    /// # Examples
    ///
    /// ```rust,no_run
    /// use sqlx_scoped_tx::{args, Connection, Scope, TxOptions};
    ///
    /// # async fn example(conn: &Connection) -> sqlx_scoped_tx::Result<()> {
    /// let scope = Scope::background();
    /// let user_id = conn
    ///     .run_in_transaction(&scope, TxOptions::default(), |tx| {
    ///         Box::pin(async move {
    ///             let scope = tx.scope().clone();
    ///             let res = tx
    ///                 .exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Bob"])
    ///                 .await?;
    ///             Ok(res.last_insert_id)
    ///         })
    ///     })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn run_in_transaction<F, T>(&self, scope: &Scope, options: TxOptions, f: F) -> Result<T>
    where
        F: for<'a> FnOnce(
            &'a mut Tx<'_>,
        ) -> Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>,
        T: Send,
    {
        crate::executor::run_in_transaction(self, scope, options, f).await
    }

    pub(crate) fn tracer(&self) -> &Arc<dyn Tracer> {
        &self.tracer
    }

    pub(crate) fn placeholder(&self) -> Placeholder {
        self.placeholder
    }

    /// Checks a connection out of the pool for [`Tx::begin`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Begin`] if no connection can be acquired.
    pub async fn acquire_for_tx(&self) -> Result<PoolConnection<Any>> {
        self.pool.acquire().await.map_err(Error::Begin)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("system", &self.config.trace.system)
            .field("database", &self.config.trace.database)
            .field("timeout", &self.config.timeout)
            .field("tracer", &self.tracer)
            .finish()
    }
}
