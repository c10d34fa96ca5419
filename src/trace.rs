//! Operation tracing.
//!
//! Every façade call opens exactly one span through the [`Tracer`] injected into its
//! [`Connection`](crate::Connection). The default, [`TracingTracer`], emits `tracing`
//! spans carrying OpenTelemetry-style fields so a `tracing-opentelemetry` layer can
//! export them unchanged.

use crate::config::TraceMeta;
use crate::error::{Error, Kind};
use crate::scope::Scope;
use std::fmt;
use std::time::Instant;
use tracing::field::Empty;

/// Opens one span per database operation.
pub trait Tracer: Send + Sync + fmt::Debug {
    /// `operation` is the operation kind (`get`, `exec`, `begin`, ...), `subject`
    /// the statement or a short description.
    fn start(&self, scope: &Scope, operation: &'static str, subject: &str) -> Box<dyn OpSpan>;
}

/// Handle to an open span. Both methods are safe to call repeatedly.
pub trait OpSpan: Send + Sync {
    /// Marks the span failed and attaches `err`.
    fn record_error(&mut self, err: &Error);

    /// Closes the span. Calls after the first are ignored.
    fn end(&mut self);

    /// The `tracing` span driver futures are instrumented with.
    fn span(&self) -> tracing::Span {
        tracing::Span::none()
    }
}

/// Tracer backed by the `tracing` crate.
#[derive(Debug, Clone)]
pub struct TracingTracer {
    meta: TraceMeta,
}

impl TracingTracer {
    pub fn new(meta: TraceMeta) -> Self {
        Self { meta }
    }
}

impl Tracer for TracingTracer {
    fn start(&self, scope: &Scope, operation: &'static str, subject: &str) -> Box<dyn OpSpan> {
        let span = tracing::info_span!(
            "db.operation",
            otel.name = %format!("db.{operation}"),
            otel.kind = "client",
            otel.status_code = Empty,
            db.system = %self.meta.system,
            db.name = %self.meta.database,
            db.operation = operation,
            db.statement = subject,
            db.deadline_ms = Empty,
            error = Empty,
        );
        if let Some(left) = scope.remaining() {
            span.record("db.deadline_ms", left.as_millis() as u64);
        }
        Box::new(TracingSpan {
            span: Some(span),
            operation,
            started: Instant::now(),
            failed: false,
        })
    }
}

struct TracingSpan {
    span: Option<tracing::Span>,
    operation: &'static str,
    started: Instant,
    failed: bool,
}

impl OpSpan for TracingSpan {
    fn record_error(&mut self, err: &Error) {
        let Some(span) = &self.span else { return };
        self.failed = true;
        span.record("otel.status_code", "ERROR");
        span.record("error", tracing::field::display(err));
        if err.is_not_found() {
            tracing::debug!(parent: span, operation = self.operation, "no rows");
        } else {
            tracing::error!(
                parent: span,
                operation = self.operation,
                error.kind = %Kind(err),
                error = %err,
                "database operation failed"
            );
        }
    }

    fn end(&mut self) {
        if let Some(span) = self.span.take() {
            if !self.failed {
                span.record("otel.status_code", "OK");
            }
            tracing::debug!(
                parent: &span,
                operation = self.operation,
                elapsed_ms = self.started.elapsed().as_millis() as u64,
                "database operation finished"
            );
        }
    }

    fn span(&self) -> tracing::Span {
        self.span.clone().unwrap_or_else(tracing::Span::none)
    }
}

impl Drop for TracingSpan {
    fn drop(&mut self) {
        self.end();
    }
}

/// Tracer that records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start(&self, _scope: &Scope, _operation: &'static str, _subject: &str) -> Box<dyn OpSpan> {
        Box::new(NoopSpan)
    }
}

struct NoopSpan;

impl OpSpan for NoopSpan {
    fn record_error(&mut self, _err: &Error) {}
    fn end(&mut self) {}
}
