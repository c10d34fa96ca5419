//! Cancellation scopes with optional deadlines.
//!
//! A [`Scope`] is threaded through every operation. Deriving a child with
//! [`Scope::with_timeout`] returns a [`Release`] that the caller must run (or drop)
//! on every exit path; releasing cancels the child and everything derived from it.
//! Cancelling a parent reaches all of its descendants.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

struct Node {
    state: Mutex<NodeState>,
    notify: Notify,
}

#[derive(Default)]
struct NodeState {
    cancelled: bool,
    children: Vec<Weak<Node>>,
}

impl Node {
    fn root() -> Arc<Self> {
        Arc::new(Node {
            state: Mutex::new(NodeState::default()),
            notify: Notify::new(),
        })
    }

    fn child(self: &Arc<Self>) -> Arc<Self> {
        let child = Node::root();
        let mut state = self.state.lock();
        if state.cancelled {
            child.state.lock().cancelled = true;
        } else {
            state.children.retain(|w| w.strong_count() > 0);
            state.children.push(Arc::downgrade(&child));
        }
        child
    }

    fn cancel(&self) {
        let children = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.children)
        };
        self.notify.notify_waiters();
        for child in children.iter().filter_map(Weak::upgrade) {
            child.cancel();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// A cancellation-and-deadline-bearing context.
///
/// Cloning a scope yields a handle to the same node; it does not derive a child.
#[derive(Clone)]
pub struct Scope {
    node: Arc<Node>,
    deadline: Option<Instant>,
}

impl Scope {
    /// A root scope that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            node: Node::root(),
            deadline: None,
        }
    }

    /// Derives a child that expires after `timeout`.
    ///
    /// A zero `timeout` yields a child that can still be cancelled through the
    /// returned [`Release`] but carries no deadline of its own. A parent deadline
    /// always wins if it is earlier.
    pub fn with_timeout(&self, timeout: Duration) -> (Scope, Release) {
        let deadline = if timeout.is_zero() {
            self.deadline
        } else {
            let own = Instant::now() + timeout;
            Some(self.deadline.map_or(own, |parent| parent.min(own)))
        };
        let node = self.node.child();
        let release = {
            let node = Arc::clone(&node);
            Release::new(move || node.cancel())
        };
        (Scope { node, deadline }, release)
    }

    /// Derives a cancelable child without adding a deadline.
    pub fn with_cancel(&self) -> (Scope, Release) {
        self.with_timeout(Duration::ZERO)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_cancelled(&self) -> bool {
        self.node.is_cancelled()
    }

    /// Fails fast if the scope is already done.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if matches!(self.deadline, Some(d) if d <= Instant::now()) {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves once this scope, or any ancestor, is cancelled.
    pub async fn cancelled(&self) {
        self.node.cancelled().await
    }

    /// Drives `fut` to completion unless the scope is cancelled or its deadline
    /// passes first, in which case `fut` is dropped.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.node.cancelled() => Err(Error::Cancelled),
            _ = expired => Err(Error::DeadlineExceeded),
            res = fut => res,
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::background()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Release function for a derived scope. Runs at most once, on [`Release::release`]
/// or on drop, whichever comes first.
pub struct Release(Option<Box<dyn FnOnce() + Send + Sync>>);

impl Release {
    pub fn new(f: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A release that does nothing.
    pub fn noop() -> Self {
        Self(None)
    }

    pub fn release(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Drop for Release {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Release")
            .field(&if self.0.is_some() { "pending" } else { "done" })
            .finish()
    }
}
