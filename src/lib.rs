//! # sqlx-scoped-tx
//!
//! Scoped transactions, per-operation timeouts and traced lazy cursors on top of SQLx.
//!
//! ## Features
//!
//! - **All-or-nothing transactions**: [`run_in_transaction`] commits when the closure
//!   returns `Ok`, rolls back when it returns `Err` or panics, and re-raises panics
//!   unchanged
//! - **Error merging**: when the rollback after a failure also fails, both messages
//!   are kept
//! - **Timeout scopes**: every query runs under a [`Scope`] with the configured
//!   deadline; the scope is released on every exit path
//! - **Tracing**: each operation opens exactly one span through an injected [`Tracer`]
//! - **Lazy resources**: [`Cursor`] keeps its scope and span open until it is closed,
//!   and closing twice is harmless; [`LazyRow`] defers execution until fetched
//! - **Named parameters**: `:name` placeholders bound from a map or a `Serialize` struct
//! - **Nested Transactions**: savepoints via [`with_nested_transaction`]
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! sqlx = { version = "0.8", features = ["runtime-tokio"] }
//! sqlx-scoped-tx = { version = "0.1", features = ["mysql"] }
//! ```
//!
//! ## Examples
//!
//! ### Basic Transaction
//!
//! ```rust,no_run
//! use sqlx_scoped_tx::{args, Config, Connection, Scope, TxOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = Connection::connect(Config::new("mysql://localhost/test")).await?;
//! let scope = Scope::background();
//!
//! conn.run_in_transaction(&scope, TxOptions::default(), |tx| {
//!     Box::pin(async move {
//!         let scope = tx.scope().clone();
//!         tx.exec(&scope, "INSERT INTO users (name) VALUES (?)", &args!["Alice"])
//!             .await?;
//!         Ok(())
//!     })
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Not Found
//!
//! `fetch_one` returns the driver's "no rows" sentinel unwrapped:
//!
//! ```rust,no_run
//! use sqlx_scoped_tx::{args, Connection, Scope};
//!
//! # async fn example(conn: &Connection) -> sqlx_scoped_tx::Result<()> {
//! let scope = Scope::background();
//! match conn
//!     .fetch_one::<(String,)>(&scope, "SELECT name FROM users WHERE id = ?", &args![42])
//!     .await
//! {
//!     Ok((name,)) => println!("found {name}"),
//!     Err(e) if e.is_not_found() => println!("no such user"),
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Named Parameters
//!
//! ```rust,no_run
//! use sqlx_scoped_tx::{Connection, NamedArgs, Scope};
//!
//! # async fn example(conn: &Connection) -> sqlx_scoped_tx::Result<()> {
//! let scope = Scope::background();
//! let args = NamedArgs::new().set("name", "Charlie").set("age", 30);
//! conn.exec_named(&scope, "INSERT INTO users (name, age) VALUES (:name, :age)", &args)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## How It Works
//!
//! 1. **Connection**: wraps an `AnyPool`, the [`Config`] and the [`Tracer`]
//! 2. **Tx**: wraps SQLx's `Transaction` and exposes the same query methods
//! 3. **Automatic Cleanup**: scopes, spans and cursors release themselves on drop;
//!    uncommitted transactions are rolled back
//!
//! ## Limitations
//!
//! - Backends are reached through SQLx's `Any` driver: MySQL (default feature),
//!   PostgreSQL and SQLite
//! - Transaction options are not applied on SQLite
//! - [`LazyRow`] runs under the caller's scope, without the configured timeout
//!
//! ## License
//!
//! Licensed under either of Apache License, Version 2.0 or MIT license at your option.

pub mod config;
pub mod connection;
pub mod context;
pub mod cursor;
pub mod error;
pub mod executor;
pub mod named;
pub mod query;
pub mod scope;
pub mod trace;
pub mod value;

#[cfg(feature = "anyhow")]
pub mod anyhow_compat;

pub use config::{Config, TraceMeta};
pub use connection::Connection;
pub use context::{IsolationLevel, Tx, TxOptions};
pub use cursor::{Cursor, LazyRow};
pub use error::{Error, Result};
pub use executor::{run_in_transaction, with_nested_transaction};
pub use named::{NamedArgs, Placeholder};
pub use query::{ExecResult, Row};
pub use scope::{Release, Scope};
pub use trace::{NoopTracer, OpSpan, Tracer, TracingTracer};
pub use value::{Param, Value, ValueType};

#[cfg(feature = "anyhow")]
pub use anyhow_compat::{run_in_transaction_anyhow, with_nested_transaction_anyhow};

/// Convenience re-exports for common use cases
pub mod prelude {
    pub use crate::args;
    pub use crate::config::Config;
    pub use crate::connection::Connection;
    pub use crate::context::{Tx, TxOptions};
    pub use crate::error::{Error, Result};
    pub use crate::executor::{run_in_transaction, with_nested_transaction};
    pub use crate::named::NamedArgs;
    pub use crate::scope::Scope;
}
