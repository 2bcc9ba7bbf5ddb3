//! The task primitive: a unit of async work with explicit state,
//! cancellation, outcome retrieval and continuations.
//!
//! A [`Task<T>`] is a cloneable handle to one unit of work. The state
//! machine moves `Created → Running → {Completed, Cancelled}` (or
//! `Created → Cancelled` when cancelled before starting); every
//! transition is an atomic compare-and-swap, so a task runs at most once
//! and reaches exactly one terminal state.
//!
//! Cancellation is cooperative: cancelling a running task does not
//! interrupt the work. The runner races the work against the cancel
//! signal and the context, and whichever fires first decides the outcome;
//! a late work result is discarded.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Error, TaskResult};

/// The state of a task. Transitions are monotonic along
/// `Created → Running → {Completed, Cancelled}` and
/// `Created → Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Newly created, not started.
    Created = 0,
    /// Currently running.
    Running = 1,
    /// Finished, successfully or with an error (including a contained
    /// panic).
    Completed = 2,
    /// Cancelled explicitly or by its context.
    Cancelled = 3,
}

impl State {
    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Created,
            1 => State::Running,
            2 => State::Completed,
            _ => State::Cancelled,
        }
    }

    /// True for `Completed` and `Cancelled`.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Completed | State::Cancelled)
    }
}

type Work<T> = Box<dyn FnOnce(Context) -> BoxFuture<'static, TaskResult<T>> + Send>;

const DURATION_UNSET: u64 = u64::MAX;

struct Inner<T> {
    state: AtomicU8,
    /// Fires exactly once, after the outcome is assigned.
    done: CancellationToken,
    /// Manual cancellation signal, raced against the work.
    cancel: CancellationToken,
    work: Mutex<Option<Work<T>>>,
    outcome: Mutex<Option<TaskResult<T>>>,
    duration_nanos: AtomicU64,
}

impl<T> Inner<T> {
    fn change_state(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Records the terminal outcome and releases all waiters. Only the
    /// CAS winner writes; later callers are no-ops.
    fn finish(&self, started: Instant, from: State, to: State, outcome: TaskResult<T>) {
        if self.change_state(from, to) {
            self.duration_nanos
                .store(started.elapsed().as_nanos() as u64, Ordering::Release);
            *self.outcome.lock().expect("outcome lock poisoned") = Some(outcome);
            self.done.cancel();
        }
    }
}

/// A unit of async work expected to produce a value of type `T`.
///
/// `Task` is a handle: clones share the same underlying work, state and
/// outcome. A task with `T = ()` is a *silent* task, of which only the
/// error is observable.
///
/// # Examples
///
/// ```
/// use taskx::{Context, Task};
///
/// # async {
/// let ctx = Context::background();
/// let task = Task::invoke(&ctx, |_ctx| async { Ok(21 * 2) });
/// assert_eq!(task.outcome().await, Ok(42));
/// # };
/// ```
pub struct Task<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> Task<T> {
    /// Creates a task in state `Created`; call [`Task::run`] to start it.
    pub fn new<F, Fut>(work: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(State::Created as u8),
                done: CancellationToken::new(),
                cancel: CancellationToken::new(),
                work: Mutex::new(Some(Box::new(move |ctx| work(ctx).boxed()))),
                outcome: Mutex::new(None),
                duration_nanos: AtomicU64::new(DURATION_UNSET),
            }),
        }
    }

    /// Creates one task per work function.
    pub fn new_many<F, Fut>(works: impl IntoIterator<Item = F>) -> Vec<Self>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        works.into_iter().map(Self::new).collect()
    }

    /// Creates a task and starts it right away.
    pub fn invoke<F, Fut>(ctx: &Context, work: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<T>> + Send + 'static,
    {
        let task = Self::new(work);
        task.run(ctx);
        task
    }

    /// A task that is already terminal with the given outcome.
    pub fn completed(outcome: TaskResult<T>) -> Self {
        let done = CancellationToken::new();
        done.cancel();
        Self {
            inner: Arc::new(Inner {
                state: AtomicU8::new(State::Completed as u8),
                done,
                cancel: CancellationToken::new(),
                work: Mutex::new(None),
                outcome: Mutex::new(Some(outcome)),
                duration_nanos: AtomicU64::new(0),
            }),
        }
    }

    /// Starts the task asynchronously. Only the first call has any
    /// effect; the handle is returned for chaining.
    pub fn run(&self, ctx: &Context) -> &Self {
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        tokio::spawn(async move { Inner::drive(inner, ctx).await });
        self
    }

    /// Retrieves the final value and error, waiting for the task to
    /// reach a terminal state. Every call observes the same outcome.
    pub async fn outcome(&self) -> TaskResult<T>
    where
        T: Clone,
    {
        self.inner.done.cancelled().await;
        self.inner
            .outcome
            .lock()
            .expect("outcome lock poisoned")
            .clone()
            .unwrap_or(Err(Error::ResultNotAvailable))
    }

    /// Chains a follow-up task that runs once this one is terminal. The
    /// continuation starts immediately and waits on this task's outcome;
    /// the relationship is value-only.
    pub fn continue_with<S, F, Fut>(&self, ctx: &Context, next: F) -> Task<S>
    where
        T: Clone,
        S: Send + Sync + 'static,
        F: FnOnce(Context, TaskResult<T>) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<S>> + Send + 'static,
    {
        let prev = self.clone();
        Task::invoke(ctx, move |task_ctx| async move {
            let outcome = prev.outcome().await;
            next(task_ctx, outcome).await
        })
    }

    /// Like [`Task::continue_with`] but the follow-up produces no value.
    pub fn continue_with_silent<F, Fut>(&self, ctx: &Context, next: F) -> Task<()>
    where
        T: Clone,
        F: FnOnce(Context, TaskResult<T>) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        self.continue_with(ctx, next)
    }
}

impl Task<()> {
    /// Creates a silent task; only its error is observable.
    pub fn new_silent<F, Fut>(work: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        Self::new(work)
    }

    /// Creates a silent task and starts it right away.
    pub fn invoke_silent<F, Fut>(ctx: &Context, work: F) -> Self
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult<()>> + Send + 'static,
    {
        Self::invoke(ctx, work)
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    async fn drive(inner: Arc<Inner<T>>, ctx: Context) {
        // Prevent the same task from running twice.
        if !inner.change_state(State::Created, State::Running) {
            return;
        }

        let work = inner.work.lock().expect("work lock poisoned").take();
        let Some(work) = work else { return };

        let started = Instant::now();

        // The work runs on its own tokio task so it can be raced against
        // cancellation without being polled after the race is decided.
        // Panics are contained here and become error outcomes.
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let work_ctx = ctx.clone();
        tokio::spawn(async move {
            let result = AssertUnwindSafe(work(work_ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(Error::panicked(payload)));
            let _ = outcome_tx.send(result);
        });

        tokio::select! {
            _ = inner.cancel.cancelled() => {
                inner.finish(started, State::Running, State::Cancelled, Err(Error::Cancelled));
            }
            _ = ctx.done() => {
                inner.finish(started, State::Running, State::Cancelled, Err(ctx.error()));
            }
            result = outcome_rx => {
                // A closed channel means the work was torn down mid-run,
                // e.g. the runtime is shutting down.
                let outcome = result
                    .unwrap_or_else(|_| Err(Error::msg("task aborted before producing an outcome")));
                inner.finish(started, State::Running, State::Completed, outcome);
            }
        }
    }
}

/// Object-safe view of a task: everything except the typed outcome.
///
/// Every [`Task<T>`] implements this trait; patterns and the worker pool
/// accept `impl SilentTask` or `Arc<dyn SilentTask>` to work with
/// heterogeneous tasks.
#[async_trait]
pub trait SilentTask: Send + Sync {
    /// Starts the task asynchronously; the first call wins.
    fn execute(&self, ctx: &Context);

    /// Starts the task on the current tokio task and waits for it to
    /// reach a terminal state.
    async fn execute_and_wait(&self, ctx: &Context);

    /// Waits for the task to reach a terminal state.
    async fn wait(&self);

    /// Waits, then reports the error if the task failed.
    async fn error(&self) -> Option<Error>;

    /// Cancels the task. Before the first run the task jumps straight to
    /// `Cancelled`; while running, the cancel signal is raced against
    /// the work; on a terminal task this is a no-op. Safe to call any
    /// number of times.
    fn cancel(&self);

    /// Current state; non-blocking.
    fn state(&self) -> State;

    /// Wall-clock duration from work start to the terminal transition,
    /// if the task has run.
    fn duration(&self) -> Option<Duration>;
}

#[async_trait]
impl<T: Send + Sync + 'static> SilentTask for Task<T> {
    fn execute(&self, ctx: &Context) {
        self.run(ctx);
    }

    async fn execute_and_wait(&self, ctx: &Context) {
        Inner::drive(Arc::clone(&self.inner), ctx.clone()).await;
        // drive returns without waiting when another caller already
        // started the task; waiting on the done signal covers that race.
        self.inner.done.cancelled().await;
    }

    async fn wait(&self) {
        self.inner.done.cancelled().await;
    }

    async fn error(&self) -> Option<Error> {
        self.inner.done.cancelled().await;
        self.inner
            .outcome
            .lock()
            .expect("outcome lock poisoned")
            .as_ref()
            .and_then(|outcome| outcome.as_ref().err().cloned())
    }

    fn cancel(&self) {
        if self.inner.change_state(State::Created, State::Cancelled) {
            *self.inner.outcome.lock().expect("outcome lock poisoned") =
                Some(Err(Error::Cancelled));
            self.inner.duration_nanos.store(0, Ordering::Release);
            self.inner.done.cancel();
            return;
        }
        self.inner.cancel.cancel();
    }

    fn state(&self) -> State {
        State::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    fn duration(&self) -> Option<Duration> {
        match self.inner.duration_nanos.load(Ordering::Acquire) {
            DURATION_UNSET => None,
            nanos => Some(Duration::from_nanos(nanos)),
        }
    }
}
