//! Batch accumulation with size-, interval- and shutdown-triggered
//! flushing.
//!
//! A [`Batcher`] sits in the back of a request path and accumulates
//! payloads. Each batch is processed by exactly one executor task; a
//! monotonically increasing batch id guarantees that concurrent flush
//! triggers (size threshold, interval probe, explicit call, shutdown)
//! cannot double-process a batch.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tracing::debug;

use crate::context::Context;
use crate::error::{Error, TaskResult};
use crate::task::{SilentTask, Task};

type ProcessFn<P> = Arc<dyn Fn(Vec<P>) -> TaskResult<()> + Send + Sync>;

/// Configures and builds a [`Batcher`].
pub struct BatcherBuilder<P> {
    process_fn: ProcessFn<P>,
    auto_process_size: Option<usize>,
    auto_process_interval: Option<Duration>,
    shutdown_grace: Option<Duration>,
}

impl<P: Send + 'static> BatcherBuilder<P> {
    /// Automatically flushes whenever the pending queue reaches `size`.
    pub fn auto_process_size(mut self, size: usize) -> Self {
        self.auto_process_size = (size > 0).then_some(size);
        self
    }

    /// Automatically flushes pending payloads on an interval.
    ///
    /// The interval is a minimum: the probe snapshots the batch id before
    /// sleeping and skips already-processed batches, so steady-state
    /// flush latency can reach twice the interval.
    ///
    /// Clients MUST call [`Batcher::shutdown`] to reap the interval
    /// probe.
    pub fn auto_process_interval(mut self, interval: Duration) -> Self {
        self.auto_process_interval = (interval > Duration::ZERO).then_some(interval);
        self
    }

    /// Bounds how long [`Batcher::shutdown`] waits for the final batch.
    /// Past the grace period the executor observes
    /// [`Error::DeadlineExceeded`]. Without a grace the shutdown waits
    /// for the final batch to fully complete.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = (grace > Duration::ZERO).then_some(grace);
        self
    }

    /// Builds the batcher and spawns the interval probe if configured.
    pub fn build(self) -> Batcher<P> {
        let shared = Arc::new(Shared {
            process_fn: self.process_fn,
            auto_process_size: self.auto_process_size,
            shutdown_grace: self.shutdown_grace,
            active: AtomicBool::new(true),
            batch_id: AtomicU64::new(0),
            core: Mutex::new(Core {
                active: true,
                pending: Vec::new(),
                executor: None,
            }),
        });

        if let Some(interval) = self.auto_process_interval {
            let probe = Arc::clone(&shared);
            tokio::spawn(async move {
                loop {
                    let snapshot = probe.batch_id.load(Ordering::Acquire);

                    tokio::time::sleep(interval).await;

                    // Best effort to avoid taking the lock for batches
                    // that already flushed; the locked flush re-checks.
                    if snapshot == probe.batch_id.load(Ordering::Acquire) {
                        let mut core = probe.core.lock().await;
                        probe
                            .do_process(&mut core, &Context::background(), false, snapshot)
                            .await;
                    }

                    if !probe.active.load(Ordering::Acquire) {
                        return;
                    }
                }
            });
        }

        Batcher { shared }
    }
}

struct Executor<P> {
    task: Task<()>,
    /// Hands the captured batch to the executor; dropped unsent when the
    /// batcher shuts down with nothing pending.
    feed: Option<oneshot::Sender<Vec<P>>>,
}

struct Core<P> {
    active: bool,
    pending: Vec<P>,
    executor: Option<Executor<P>>,
}

struct Shared<P> {
    process_fn: ProcessFn<P>,
    auto_process_size: Option<usize>,
    shutdown_grace: Option<Duration>,
    /// Mirrors `Core::active` for reads outside the lock.
    active: AtomicBool,
    /// Current batch id, readable without the lock by the interval probe.
    batch_id: AtomicU64,
    core: Mutex<Core<P>>,
}

/// A batch processor accumulating payloads of type `P` and flushing them
/// as a group through a user-supplied batch function.
///
/// # Examples
///
/// ```
/// use taskx::{Batcher, Context, SilentTask};
///
/// # async {
/// let batcher = Batcher::builder(|batch: Vec<i32>| {
///         println!("processing {batch:?}");
///         Ok(())
///     })
///     .auto_process_size(10)
///     .build();
///
/// let task = batcher.append(7).await;
/// batcher.process(&Context::background()).await;
/// assert!(task.error().await.is_none());
/// batcher.shutdown().await;
/// # };
/// ```
pub struct Batcher<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for Batcher<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P: Send + 'static> Batcher<P> {
    /// Starts building a batcher around the given batch function.
    pub fn builder<F>(process_fn: F) -> BatcherBuilder<P>
    where
        F: Fn(Vec<P>) -> TaskResult<()> + Send + Sync + 'static,
    {
        BatcherBuilder {
            process_fn: Arc::new(process_fn),
            auto_process_size: None,
            auto_process_interval: None,
            shutdown_grace: None,
        }
    }

    /// Adds a payload to the current batch and returns a task tied to
    /// that batch's outcome. After [`Batcher::shutdown`] the returned
    /// task is pre-completed with [`Error::BatcherNotActive`].
    pub async fn append(&self, payload: P) -> Task<()> {
        let mut core = self.shared.core.lock().await;

        if !core.active {
            return Task::completed(Err(Error::BatcherNotActive));
        }

        // Make sure we have an executor for the current batch.
        if core.executor.is_none() {
            core.executor = Some(self.shared.new_executor());
        }

        core.pending.push(payload);

        if self.shared.auto_process_size == Some(core.pending.len()) {
            let captured = self.shared.batch_id.load(Ordering::Acquire);
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                let mut core = shared.core.lock().await;
                shared
                    .do_process(&mut core, &Context::background(), false, captured)
                    .await;
            });
        }

        let executor = core
            .executor
            .as_ref()
            .map(|e| e.task.clone())
            .unwrap_or_else(|| Task::completed(Err(Error::BatcherNotActive)));

        Task::new_silent(move |_ctx| async move {
            executor.wait().await;
            match executor.error().await {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }

    /// The number of payloads waiting in the current batch.
    pub async fn size(&self) -> usize {
        self.shared.core.lock().await.pending.len()
    }

    /// Flushes the current batch now.
    pub async fn process(&self, ctx: &Context) {
        let mut core = self.shared.core.lock().await;
        let current = self.shared.batch_id.load(Ordering::Acquire);
        self.shared.do_process(&mut core, ctx, false, current).await;
    }

    /// Flushes the final batch and deactivates the batcher. Blocks for
    /// the final batch, up to the configured grace. Later `append` calls
    /// fail with [`Error::BatcherNotActive`] and `process` is a no-op.
    pub async fn shutdown(&self) {
        let mut core = self.shared.core.lock().await;

        let ctx = match self.shared.shutdown_grace {
            Some(grace) => Context::background().with_timeout(grace),
            None => Context::background(),
        };

        let current = self.shared.batch_id.load(Ordering::Acquire);
        self.shared.do_process(&mut core, &ctx, true, current).await;

        core.active = false;
        self.shared.active.store(false, Ordering::Release);
        debug!("batcher shut down");
    }
}

impl<P: Send + 'static> Shared<P> {
    fn new_executor(&self) -> Executor<P> {
        let (feed_tx, feed_rx) = oneshot::channel::<Vec<P>>();
        let process_fn = Arc::clone(&self.process_fn);

        let task = Task::new_silent(move |_ctx| async move {
            // Block here until a batch is handed over; a dropped sender
            // means the batcher shut down with nothing to process.
            match feed_rx.await {
                Ok(batch) => process_fn(batch),
                Err(_) => Ok(()),
            }
        });

        Executor {
            task,
            feed: Some(feed_tx),
        }
    }

    /// Flushes the batch identified by `for_batch_id`. Caller holds the
    /// core lock.
    async fn do_process(
        &self,
        core: &mut Core<P>,
        ctx: &Context,
        shutting_down: bool,
        for_batch_id: u64,
    ) {
        // A later flush already won this batch id.
        if self.batch_id.load(Ordering::Acquire) != for_batch_id {
            return;
        }

        if core.pending.is_empty() {
            if shutting_down {
                if let Some(executor) = core.executor.as_mut() {
                    executor.feed.take();
                }
            }
            return;
        }

        let batch = std::mem::take(&mut core.pending);
        debug!(size = batch.len(), batch_id = for_batch_id, "flushing batch");

        let Some(executor) = core.executor.as_mut() else {
            return;
        };

        if let Some(feed) = executor.feed.take() {
            let _ = feed.send(batch);
        }

        let running = executor.task.clone();
        running.execute(ctx);

        // Block and wait for the last batch to complete on shutdown.
        if shutting_down {
            running.wait().await;
            return;
        }

        // Prepare a fresh executor and retire the current batch id so
        // the interval probe skips it.
        core.executor = Some(self.new_executor());
        self.batch_id.fetch_add(1, Ordering::AcqRel);
    }
}
