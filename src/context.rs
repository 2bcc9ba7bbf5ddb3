//! Cancellation contexts with optional deadlines.
//!
//! A [`Context`] carries a cancellation signal down a tree of tasks, plus
//! an optional deadline. Child contexts are cancelled when their parent
//! is; deadlines only ever tighten. Patterns and the worker pool accept a
//! context and observe it at their suspension points.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Error;

/// A cancellation scope handed to every piece of async work.
///
/// Cloning is cheap; all clones share the same cancellation signal.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use taskx::Context;
///
/// # async {
/// let ctx = Context::background().with_timeout(Duration::from_millis(50));
/// ctx.done().await; // resolves once the deadline passes
/// assert!(ctx.is_done());
/// # };
/// ```
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A root context that is never done on its own.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A cancellable child. Cancelling the parent cancels the child;
    /// cancelling the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// A child whose deadline is `timeout` from now (or the parent's
    /// deadline, whichever comes first).
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// A child bound by `deadline` (or the parent's deadline, whichever
    /// comes first).
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) => parent.min(deadline),
            None => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if one is set.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True once the context has been cancelled or its deadline passed.
    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline_passed()
    }

    /// Resolves when the context is cancelled or its deadline passes.
    /// Never resolves for a plain background context.
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

    /// The error describing why this context is done: deadline first,
    /// cancellation otherwise.
    pub fn error(&self) -> Error {
        if self.deadline_passed() {
            Error::DeadlineExceeded
        } else {
            Error::Cancelled
        }
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
