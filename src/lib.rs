//! Async Task Runtime & Computation Engine
//!
//! A two-layer concurrency toolkit built on tokio:
//!
//! - a **task runtime**: composable units of async work with explicit
//!   state, cooperative cancellation, continuations and a family of
//!   scheduling patterns (fork/join, concurrency-capped runs, throttling,
//!   time-spreading, periodic repeat, jittering, batched reduction,
//!   worker-pool dispatch, keyed partitioning);
//! - a **computation engine**: user-defined *plans* declare their inputs
//!   and outputs, a registry maps each output to a *computer*, and the
//!   engine executes the computers in parallel or sequential order with
//!   pre/post hooks and nested-plan composition.
//!
//! # Features
//!
//! - **Explicit task lifecycle**: `Created → Running → {Completed,
//!   Cancelled}`, atomic transitions, one-shot completion signal,
//!   repeatable outcome reads.
//! - **Cooperative cancellation**: cancelling never interrupts running
//!   work; the runtime races the work against the cancel signal and the
//!   [`Context`], and the first to fire decides the outcome.
//! - **Panic containment**: a panic inside task work becomes an error
//!   outcome carrying the payload and a backtrace.
//! - **Elastic worker pool**: bounded workers with an unbounded FIFO
//!   waiting queue, burst expansion, idle reaping, pause/resume and
//!   two-phase shutdown.
//! - **Batching**: size-, interval- and shutdown-triggered flushing with
//!   exactly one executor per batch and a bounded shutdown grace.
//! - **Declarative plans**: no reflection and no global registries. A
//!   plan describes its components in a typed [`Blueprint`], and typed
//!   [`AsyncResult`] accessors unwrap computer outputs.
//!
//! # Quick Start
//!
//! ```
//! use taskx::{fork_join, Context, SilentTask, Task};
//!
//! # async {
//! let ctx = Context::background();
//!
//! // A typed task.
//! let doubled = Task::invoke(&ctx, |_ctx| async { Ok(21 * 2) });
//! assert_eq!(doubled.outcome().await, Ok(42));
//!
//! // A continuation.
//! let plus_one = doubled.continue_with(&ctx, |_ctx, outcome| async move {
//!     Ok(outcome? + 1)
//! });
//! assert_eq!(plus_one.outcome().await, Ok(43));
//!
//! // Fork/join over a batch.
//! let batch = Task::new_many((0..8).map(|i| move |_ctx| async move { Ok(i) }));
//! fork_join(&ctx, batch).wait().await;
//! # };
//! ```
//!
//! # Cancellation Model
//!
//! Every long-running operation accepts a [`Context`]. Cancelling the
//! context (or passing its deadline) makes patterns cancel their
//! untouched tail, streaming consumers drain-and-cancel their input, and
//! running tasks resolve with the context's error. User work observes
//! cancellation only at its own await points; there is no preemption.
//!
//! # Background Resources
//!
//! Two components own background tasks and must be shut down explicitly:
//! a [`Batcher`] with an auto-process interval (call
//! [`Batcher::shutdown`]) and the [`WorkerPool`] (call
//! [`WorkerPool::stop`] or [`WorkerPool::stop_wait`]).
//!
//! # The Engine
//!
//! Computers are registered per output key; plans declare components in
//! a [`Blueprint`]; [`Engine::execute`] runs pre-hooks, components and
//! post-hooks, cancelling sibling components on the first error. See
//! [`Engine`] for a worked example.

mod batcher;
mod cap;
mod computer;
mod context;
mod engine;
mod error;
mod fork_join;
mod jitter;
mod partitioner;
mod plan;
mod pool;
mod repeat;
mod spread;
mod task;
mod throttle;

pub use batcher::{Batcher, BatcherBuilder};
pub use cap::{run_with_concurrency, run_with_concurrency_stream};
pub use computer::{
    outcome_value, AsyncOutput, AsyncResult, Computer, OutcomeValue, SilentComputer,
};
pub use context::Context;
pub use engine::Engine;
pub use error::{Error, TaskResult};
pub use fork_join::{cancel_all, fork_join, wait_all};
pub use jitter::{add_jitter, add_jitter_silent, do_jitter};
pub use partitioner::Partitioner;
pub use plan::{expect_plan, Blueprint, MasterPlan, Plan, PlanView, PostHook, PreHook};
pub use pool::{WorkerPool, WorkerPoolBuilder};
pub use repeat::repeat;
pub use spread::spread;
pub use task::{SilentTask, State, Task};
pub use throttle::throttle;
