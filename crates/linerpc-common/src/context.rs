//! Deadline and cancellation handle for blocking operations.
//!
//! Every operation that can wait (connection lease, frame read, retry
//! backoff, handler invocation) accepts a [`Context`]. Cancelling the
//! context or letting its deadline pass aborts the wait; the underlying
//! connection may still finish its I/O before being returned or destroyed.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::{Error, Result};

/// A cancellation handle with an optional deadline.
///
/// Contexts are cheap to clone; clones share the same cancellation token.
/// [`Context::child`] derives a context that is cancelled with its parent
/// but can be cancelled independently.
#[derive(Debug, Clone)]
pub struct Context {
    deadline: Option<Instant>,
    token: CancellationToken,
}

impl Context {
    /// A context that never expires and is never cancelled (unless
    /// [`Context::cancel`] is called on it).
    pub fn background() -> Self {
        Self {
            deadline: None,
            token: CancellationToken::new(),
        }
    }

    /// A context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            token: CancellationToken::new(),
        }
    }

    /// A context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            token: CancellationToken::new(),
        }
    }

    /// Derive a context cancelled together with `self`, optionally with a
    /// tighter deadline.
    pub fn child(&self) -> Self {
        Self {
            deadline: self.deadline,
            token: self.token.child_token(),
        }
    }

    /// Cancel the context, waking every task waiting on [`Context::done`].
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline; `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Whether the deadline has already passed.
    pub fn is_expired(&self) -> bool {
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::Canceled);
        }
        if self.is_expired() {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// The error this context is currently done with, if any.
    pub fn error(&self) -> Option<Error> {
        self.check().err()
    }

    /// Resolve when the context is cancelled or its deadline passes.
    /// Pending forever on a background context.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_is_never_done() {
        let ctx = Context::background();
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());
        assert!(!ctx.is_expired());
    }

    #[tokio::test]
    async fn test_elapsed_deadline_fails_check() {
        let ctx = Context::with_timeout(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(ctx.is_expired());
        assert!(matches!(ctx.check(), Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_cancel_wakes_done() {
        let ctx = Context::background();
        let child = ctx.clone();
        let waiter = tokio::spawn(async move { child.done().await });
        ctx.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("done() did not resolve after cancel")
            .unwrap();
        assert!(matches!(ctx.check(), Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn test_child_cancelled_with_parent() {
        let parent = Context::background();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn test_child_cancel_does_not_affect_parent() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_wakes_done() {
        let ctx = Context::with_timeout(Duration::from_millis(20));
        tokio::time::timeout(Duration::from_secs(1), ctx.done())
            .await
            .expect("done() did not resolve at deadline");
    }
}
