//! Error types shared by the task runtime and the computation engine.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt::Display;
use std::sync::Arc;

/// Result alias used across the crate.
pub type TaskResult<T> = Result<T, Error>;

/// Errors produced by tasks, scheduling patterns and the engine.
///
/// The enum is `Clone` so that a task's stored outcome can be observed by
/// any number of waiters; variants carrying non-cloneable payloads wrap
/// them in [`Arc`].
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The task was cancelled via [`crate::SilentTask::cancel`].
    #[error("task cancelled")]
    Cancelled,

    /// The context's deadline passed before the work finished.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The work function panicked. The message carries the panic payload
    /// and a backtrace captured at the recovery site.
    #[error("panic executing task: {message}")]
    Panicked { message: String },

    /// Returned by [`crate::Batcher::append`] after the batcher shut down.
    #[error("batch processor has already shut down")]
    BatcherNotActive,

    /// The plan has not been analyzed by the engine yet.
    #[error("plan must be analyzed before it can be executed")]
    PlanNotAnalyzed,

    /// Thrown by hooks or computers to end plan execution early. The
    /// engine swallows this error at the top level and reports success.
    #[error("plan execution ending early")]
    PlanExecutionEndingEarly,

    /// A sequential plan declared an asynchronously-computed output.
    #[error("sequential plans cannot hold async outputs")]
    SequentialPlanHasAsyncOutput,

    /// Executability probing found a component that cannot run.
    #[error("plan is not executable: {0}")]
    PlanNotExecutable(String),

    /// An [`crate::AsyncResult`] was read before the engine bound a task
    /// to it, or its outcome did not hold the expected type.
    #[error("async result is not available")]
    ResultNotAvailable,

    /// Any other error raised by user-supplied work.
    #[error("{0}")]
    Other(Arc<anyhow::Error>),
}

/// Structural equality: variants with payloads compare their rendered
/// messages, which is what tests and callers matching on outcomes need.
impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Error::Panicked { message: a }, Error::Panicked { message: b }) => a == b,
            (Error::PlanNotExecutable(a), Error::PlanNotExecutable(b)) => a == b,
            (Error::Other(a), Error::Other(b)) => a.to_string() == b.to_string(),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl Error {
    /// Wraps an arbitrary error raised by user work.
    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        Error::Other(Arc::new(err.into()))
    }

    /// Creates an error from a printable message.
    pub fn msg(message: impl Display) -> Self {
        Error::Other(Arc::new(anyhow::Error::msg(message.to_string())))
    }

    /// True when this error came from cancellation or a missed deadline.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Error::Cancelled | Error::DeadlineExceeded)
    }

    /// Converts a panic payload into an error, capturing a backtrace.
    pub(crate) fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let backtrace = Backtrace::force_capture();
        Error::Panicked {
            message: format!("{}\n{}", panic_text(payload.as_ref()), backtrace),
        }
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_text(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
