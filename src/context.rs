//! Request-scoped cancellation and deadlines.
//!
//! Every request gets a root [`Context`] whose token is cancelled when the
//! client goes away. Timeouts derive child contexts whose deadline can only
//! move earlier than the parent's.

use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Why a context is done.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never done unless cancelled explicitly.
    pub fn background() -> Self {
        Self::default()
    }

    /// A child that is cancelled with this context but can also be
    /// cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child context with the earlier of the two deadlines.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let mut ctx = self.child();
        ctx.deadline = Some(match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        });
        ctx
    }

    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels this context when the guard is dropped.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// `None` while the context is live.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_follows_parent() {
        let parent = Context::background();
        let child = parent.child();
        assert_eq!(child.err(), None);

        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Canceled));
    }

    #[test]
    fn test_child_cancel_does_not_leak_upwards() {
        let parent = Context::background();
        let child = parent.child();
        child.cancel();
        assert_eq!(parent.err(), None);
    }

    #[tokio::test]
    async fn test_timeout_only_tightens() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let loose = parent.with_timeout(Duration::from_secs(3600));
        assert_eq!(loose.deadline(), parent.deadline());

        let tight = parent.with_timeout(Duration::from_millis(1));
        assert!(tight.deadline() < parent.deadline());
    }

    #[tokio::test]
    async fn test_done_on_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(5));
        assert_eq!(ctx.done().await, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_drop_guard_cancels() {
        let ctx = Context::background();
        {
            let _guard = ctx.cancel_on_drop();
        }
        assert_eq!(ctx.done().await, ContextError::Canceled);
    }
}
