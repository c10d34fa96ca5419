#![allow(dead_code)]

use parking_lot::Mutex;
use sqlx_scoped_tx::{Config, Connection, Error, OpSpan, Scope, Tracer};
use std::sync::Arc;
use std::time::Duration;

pub const USERS: &str = "CREATE TABLE users (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    age INTEGER
)";

/// One entry per span opened through a [`RecordingTracer`].
#[derive(Debug, Clone, Default)]
pub struct Recorded {
    pub operation: &'static str,
    pub subject: String,
    pub errors: Vec<String>,
    pub ends: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    spans: Arc<Mutex<Vec<Recorded>>>,
}

impl RecordingTracer {
    pub fn spans(&self) -> Vec<Recorded> {
        self.spans.lock().clone()
    }

    pub fn clear(&self) {
        self.spans.lock().clear();
    }

    pub fn by_operation(&self, operation: &str) -> Vec<Recorded> {
        self.spans()
            .into_iter()
            .filter(|s| s.operation == operation)
            .collect()
    }
}

impl Tracer for RecordingTracer {
    fn start(&self, _scope: &Scope, operation: &'static str, subject: &str) -> Box<dyn OpSpan> {
        let mut spans = self.spans.lock();
        spans.push(Recorded {
            operation,
            subject: subject.to_string(),
            ..Default::default()
        });
        Box::new(RecordingSpan {
            spans: Arc::clone(&self.spans),
            index: spans.len() - 1,
        })
    }
}

struct RecordingSpan {
    spans: Arc<Mutex<Vec<Recorded>>>,
    index: usize,
}

impl OpSpan for RecordingSpan {
    fn record_error(&mut self, err: &Error) {
        self.spans.lock()[self.index].errors.push(err.to_string());
    }

    fn end(&mut self) {
        self.spans.lock()[self.index].ends += 1;
    }
}

/// In-memory SQLite with one pooled connection, so every statement sees the same
/// database.
pub async fn connect() -> Connection {
    let config = Config::new("sqlite::memory:")
        .with_max_connections(1)
        .with_timeout(Duration::from_secs(5));
    let conn = Connection::connect(config).await.unwrap();
    conn.exec(&Scope::background(), USERS, &[]).await.unwrap();
    conn
}

pub async fn connect_traced() -> (Connection, RecordingTracer) {
    let tracer = RecordingTracer::default();
    let conn = connect().await.with_tracer(Arc::new(tracer.clone()));
    (conn, tracer)
}

pub async fn count_users(conn: &Connection) -> i64 {
    let (n,): (i64,) = conn
        .fetch_one(&Scope::background(), "SELECT COUNT(*) FROM users", &[])
        .await
        .unwrap();
    n
}
