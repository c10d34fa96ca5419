use std::fmt;

/// Error types for scoped transaction management
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error from SQLx, passed through unwrapped.
    ///
    /// `sqlx::Error::RowNotFound` always arrives here so callers can branch on it;
    /// see [`Error::is_not_found`].
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A query failed; carries the operation kind and the statement.
    #[error("failed to execute {op} query: {statement}: {source}")]
    Query {
        op: &'static str,
        statement: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("failed to begin transaction: {0}")]
    Begin(#[source] sqlx::Error),

    /// The transaction must not be reused after this.
    #[error("failed to commit transaction: {0}")]
    Commit(#[source] sqlx::Error),

    #[error("failed to roll back transaction: {0}")]
    Rollback(#[source] sqlx::Error),

    /// The closure failed and so did the rollback that followed it.
    #[error("{cause}; rollback also failed: {rollback}")]
    RollbackFailed {
        #[source]
        cause: Box<Error>,
        rollback: Box<Error>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation deadline exceeded")]
    DeadlineExceeded,

    /// Transaction has already been consumed (committed or rolled back)
    #[error("Transaction has already been consumed")]
    AlreadyConsumed,

    #[error("named parameter error: {0}")]
    NamedParameter(String),

    #[error("failed to serialize named arguments: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// Application-defined failure returned from a transaction closure.
    #[error("{0}")]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an application error so a transaction closure can return it.
    ///
    /// ```
    /// let err = sqlx_scoped_tx::Error::custom("boom");
    /// assert_eq!(err.to_string(), "boom");
    /// ```
    pub fn custom(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Custom(err.into())
    }

    pub(crate) fn query(op: &'static str, statement: &str, source: sqlx::Error) -> Self {
        Error::Query {
            op,
            statement: statement.to_string(),
            source,
        }
    }

    /// True for the driver's "no rows" sentinel.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Database(sqlx::Error::RowNotFound))
    }

    /// True when the scope's deadline passed or no pooled connection became free
    /// within the acquire timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::DeadlineExceeded => true,
            Error::RollbackFailed { cause, .. } => cause.is_timeout(),
            other => matches!(other.as_sqlx(), Some(sqlx::Error::PoolTimedOut)),
        }
    }

    /// Returns the wrapped driver error, if any.
    pub fn as_sqlx(&self) -> Option<&sqlx::Error> {
        match self {
            Error::Database(e)
            | Error::Begin(e)
            | Error::Commit(e)
            | Error::Rollback(e)
            | Error::Query { source: e, .. } => Some(e),
            _ => None,
        }
    }
}

/// Result type alias for scoped transaction operations
pub type Result<T> = std::result::Result<T, Error>;

/// Short label for log fields.
pub(crate) struct Kind<'a>(pub &'a Error);

impl fmt::Display for Kind<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.0 {
            Error::Database(sqlx::Error::RowNotFound) => "not_found",
            Error::Database(_) => "database",
            Error::Query { .. } => "query",
            Error::Begin(_) => "begin",
            Error::Commit(_) => "commit",
            Error::Rollback(_) | Error::RollbackFailed { .. } => "rollback",
            Error::Cancelled => "cancelled",
            Error::DeadlineExceeded => "deadline",
            Error::AlreadyConsumed => "consumed",
            Error::NamedParameter(_) | Error::Serialize(_) => "arguments",
            Error::Config(_) => "config",
            Error::Custom(_) => "custom",
        };
        f.write_str(label)
    }
}
