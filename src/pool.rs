//! An elastic worker pool with a waiting queue, burst expansion, idle
//! reaping, pause/resume and two-phase shutdown.
//!
//! The pool owns a dispatcher task. Submitted tasks flow through a small
//! task queue into either a ready worker, a freshly spawned worker
//! (while below `max_size`), or a FIFO waiting queue. Workers are killed
//! one per idle period when nothing arrives, down to zero; they are
//! respawned on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::{Mutex, Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::context::Context;
use crate::task::{SilentTask, Task};

/// The default maximum duration a worker stays idle before one of them
/// gets killed.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

/// A task queued with the context it should execute under.
struct QueuedTask {
    task: Box<dyn SilentTask>,
    ctx: Context,
}

impl QueuedTask {
    /// Executes the queued task and waits for it to terminate; a worker
    /// must not pick up the next task before the current one is done.
    async fn run(&self) {
        self.task.execute_and_wait(&self.ctx).await;
    }

    fn cancel(&self) {
        self.task.cancel();
    }
}

/// A worker receives tasks from the shared queue; `None` tells it to
/// exit.
type WorkerMsg = Option<Arc<QueuedTask>>;

struct PoolConfig {
    max_size: usize,
    idle_timeout: Duration,
    burst_queue_threshold: usize,
    burst_capacity: usize,
}

struct PoolShared {
    config: PoolConfig,
    /// Closed when the pool starts stopping; releases paused workers.
    stop_signal: CancellationToken,
    /// Closed when the dispatcher has fully exited.
    stopped_chan: CancellationToken,
    pending_size: AtomicUsize,
    wait_before_shutdown: AtomicBool,
    /// Number of workers currently blocked waiting for a task. Handoff
    /// to the worker queue only happens while this is non-zero, so a
    /// task never sits in the queue with every worker busy.
    idle_workers: AtomicUsize,
    /// Pinged by a worker whenever it becomes idle.
    worker_idle: Notify,
}

/// Configures and builds a [`WorkerPool`].
pub struct WorkerPoolBuilder {
    max_size: usize,
    idle_timeout: Duration,
    burst_queue_threshold: usize,
    burst_capacity: usize,
}

impl WorkerPoolBuilder {
    /// Maximum number of workers under normal conditions. Zero selects
    /// the host's available parallelism.
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = if max_size == 0 {
            default_max_size()
        } else {
            max_size
        };
        self
    }

    /// How long the pool may sit idle before one worker gets killed.
    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// When the waiting queue reaches `threshold`, `capacity` extra
    /// workers are spawned. Burst workers are ordinary afterwards and
    /// get reaped by the idle timeout like any other worker.
    pub fn burst(mut self, threshold: usize, capacity: usize) -> Self {
        self.burst_queue_threshold = threshold;
        self.burst_capacity = capacity;
        self
    }

    /// Builds the pool and starts its dispatcher.
    pub fn build(self) -> WorkerPool {
        let shared = Arc::new(PoolShared {
            config: PoolConfig {
                max_size: self.max_size,
                idle_timeout: self.idle_timeout,
                burst_queue_threshold: self.burst_queue_threshold,
                burst_capacity: self.burst_capacity,
            },
            stop_signal: CancellationToken::new(),
            stopped_chan: CancellationToken::new(),
            pending_size: AtomicUsize::new(0),
            wait_before_shutdown: AtomicBool::new(false),
            idle_workers: AtomicUsize::new(0),
            worker_idle: Notify::new(),
        });

        let (task_tx, task_rx) = mpsc::channel(1);

        let dispatcher = Arc::clone(&shared);
        tokio::spawn(async move { Dispatcher::new(dispatcher).run(task_rx).await });

        WorkerPool {
            shared,
            task_tx: std::sync::Mutex::new(Some(task_tx)),
            stop_once: OnceCell::new(),
            stop_lock: Mutex::new(()),
            stopped: AtomicBool::new(false),
        }
    }
}

fn default_max_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// A pool of workers bounded by a configured maximum, with an unbounded
/// FIFO waiting queue behind it.
///
/// Clients MUST call [`WorkerPool::stop`] or [`WorkerPool::stop_wait`]
/// when the pool is no longer needed; the dispatcher is the pool's only
/// background task and is only reaped by stopping. New tasks must not be
/// submitted after stopping.
///
/// # Examples
///
/// ```
/// use taskx::{Context, Task, WorkerPool};
///
/// # async {
/// let pool = WorkerPool::builder().max_size(4).build();
/// let ctx = Context::background();
///
/// let task = Task::new_silent(|_ctx| async { Ok(()) });
/// pool.submit(&ctx, task.clone()).await;
///
/// pool.stop_wait().await;
/// # };
/// ```
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    /// Dropped on stop, which closes the dispatcher's input.
    task_tx: std::sync::Mutex<Option<mpsc::Sender<QueuedTask>>>,
    stop_once: OnceCell<()>,
    /// Serializes pause with stop.
    stop_lock: Mutex<()>,
    stopped: AtomicBool,
}

impl WorkerPool {
    /// Starts building a pool. Defaults: `max_size` = available
    /// parallelism, `idle_timeout` = 2s, no burst.
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            max_size: default_max_size(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            burst_queue_threshold: 0,
            burst_capacity: 0,
        }
    }

    /// The maximum number of concurrent workers.
    pub fn size(&self) -> usize {
        self.shared.config.max_size
    }

    /// The number of tasks in the waiting queue.
    pub fn waiting_queue_size(&self) -> usize {
        self.shared.pending_size.load(Ordering::Acquire)
    }

    /// True once the pool has been stopped.
    pub fn stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Enqueues a task for a worker to execute under `ctx`.
    ///
    /// The task goes to an available worker, to a newly started worker,
    /// or, when the pool is at its maximum, onto the waiting queue.
    /// Submitting after [`WorkerPool::stop`] is a client error; the task
    /// is dropped with a warning.
    pub async fn submit(&self, ctx: &Context, task: impl SilentTask + 'static) {
        let sender = self.task_tx.lock().expect("task sender lock poisoned").clone();

        match sender {
            Some(sender) => {
                let queued = QueuedTask {
                    task: Box::new(task),
                    ctx: ctx.clone(),
                };
                if sender.send(queued).await.is_err() {
                    warn!("task submitted to a stopped worker pool; dropping it");
                }
            }
            None => warn!("task submitted to a stopped worker pool; dropping it"),
        }
    }

    /// Makes all workers wait on `ctx`, so no submitted task runs until
    /// `ctx` is cancelled or times out. Returns once every worker is
    /// paused. Tasks can still be queued meanwhile.
    ///
    /// Concurrent `pause` calls queue up: a later call does not return
    /// until the earlier pause's context is cancelled. Stopping the pool
    /// releases paused workers.
    pub async fn pause(&self, ctx: &Context) {
        let _guard = self.stop_lock.lock().await;

        if self.stopped() {
            return;
        }

        let max_size = self.shared.config.max_size;
        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(max_size.max(1));

        for _ in 0..max_size {
            let ready = ready_tx.clone();
            let stop_signal = self.shared.stop_signal.clone();
            let pause_task = Task::new_silent(move |task_ctx| async move {
                let _ = ready.send(()).await;

                tokio::select! {
                    _ = task_ctx.done() => {}
                    _ = stop_signal.cancelled() => {}
                }

                Ok(())
            });

            self.submit(ctx, pause_task).await;
        }
        drop(ready_tx);

        // Wait for all workers to be paused.
        for _ in 0..max_size {
            if ready_rx.recv().await.is_none() {
                break;
            }
        }
    }

    /// Stops the pool, waiting for running tasks to complete. Tasks
    /// still in the waiting queue are cancelled.
    pub async fn stop(&self) {
        self.stop_inner(false).await;
    }

    /// Stops the pool, waiting for running tasks AND all queued tasks to
    /// complete.
    pub async fn stop_wait(&self) {
        self.stop_inner(true).await;
    }

    /// Idempotent: the first caller runs the stop sequence, every caller
    /// waits for the dispatcher to exit.
    async fn stop_inner(&self, wait_before_shutdown: bool) {
        self.stop_once
            .get_or_init(|| async {
                // Unpause all paused workers first, so any pause in
                // progress can finish and release the stop lock.
                self.shared.stop_signal.cancel();

                let guard = self.stop_lock.lock().await;
                // The stopped flag prevents the pool from being paused
                // again, making it safe to close the task queue.
                self.stopped.store(true, Ordering::Release);
                drop(guard);

                self.shared
                    .wait_before_shutdown
                    .store(wait_before_shutdown, Ordering::Release);

                // Closing the task queue tells the dispatcher to drain
                // and shut down.
                self.task_tx
                    .lock()
                    .expect("task sender lock poisoned")
                    .take();
            })
            .await;

        self.shared.stopped_chan.cancelled().await;
    }
}

/// The pool's dispatcher: moves submitted tasks to workers, grows and
/// shrinks the worker set, and drains everything on shutdown.
struct Dispatcher {
    shared: Arc<PoolShared>,
    worker_tx: mpsc::Sender<WorkerMsg>,
    worker_rx: Arc<Mutex<mpsc::Receiver<WorkerMsg>>>,
    waiting: VecDeque<Arc<QueuedTask>>,
    workers: Vec<JoinHandle<()>>,
    worker_count: usize,
}

impl Dispatcher {
    fn new(shared: Arc<PoolShared>) -> Self {
        let (worker_tx, worker_rx) = mpsc::channel(1);
        Self {
            shared,
            worker_tx,
            worker_rx: Arc::new(Mutex::new(worker_rx)),
            waiting: VecDeque::new(),
            workers: Vec::new(),
            worker_count: 0,
        }
    }

    async fn run(mut self, mut task_rx: mpsc::Receiver<QueuedTask>) {
        let idle_timeout = self.shared.config.idle_timeout;
        let mut idle = false;

        loop {
            // While the waiting queue is not empty, incoming tasks go to
            // its back and the head feeds the next ready worker.
            if !self.waiting.is_empty() {
                if !self.process_waiting_queue(&mut task_rx).await {
                    break;
                }
                continue;
            }

            tokio::select! {
                maybe = task_rx.recv() => {
                    let Some(queued) = maybe else { break };
                    self.dispatch(Arc::new(queued));
                    idle = false;
                }
                _ = tokio::time::sleep(idle_timeout) => {
                    // Nothing arrived for a full idle period. Kill one
                    // ready worker if the previous period was also idle.
                    if idle && self.worker_count > 0 && self.has_ready_worker()
                        && self.worker_tx.try_send(None).is_ok()
                    {
                        self.worker_count -= 1;
                        debug!(workers = self.worker_count, "killed idle worker");
                    }
                    idle = true;
                }
            }
        }

        self.shutdown().await;
    }

    fn has_ready_worker(&self) -> bool {
        self.shared.idle_workers.load(Ordering::Acquire) > 0
    }

    /// Hands a task to a ready worker, spawns a new worker for it, or
    /// queues it.
    fn dispatch(&mut self, queued: Arc<QueuedTask>) {
        if self.has_ready_worker() {
            match self.worker_tx.try_send(Some(queued)) {
                Ok(()) => return,
                Err(err) => {
                    if let Some(queued) = err.into_inner() {
                        self.overflow(queued);
                    }
                    return;
                }
            }
        }

        self.overflow(queued);
    }

    /// No worker could take the task right now: grow the pool or queue
    /// the task.
    fn overflow(&mut self, queued: Arc<QueuedTask>) {
        if self.worker_count < self.shared.config.max_size {
            self.spawn_worker(Some(queued));
            self.worker_count += 1;
        } else {
            self.push_back(queued);
        }
    }

    /// Runs the waiting-queue mode: enqueue arrivals, feed heads to
    /// ready workers, burst-expand on the threshold. Returns false when
    /// the pool is stopping.
    async fn process_waiting_queue(&mut self, task_rx: &mut mpsc::Receiver<QueuedTask>) -> bool {
        let ready = self.has_ready_worker();
        let worker_tx = self.worker_tx.clone();

        tokio::select! {
            maybe = task_rx.recv() => {
                let Some(queued) = maybe else { return false };
                let queue_len = self.push_back(Arc::new(queued));

                let config = &self.shared.config;
                if config.burst_capacity > 0
                    && queue_len == config.burst_queue_threshold
                    && self.worker_count <= config.max_size
                {
                    debug!(capacity = config.burst_capacity, "burst-expanding worker pool");
                    for _ in 0..config.burst_capacity {
                        self.spawn_worker(None);
                        self.worker_count += 1;
                    }
                }
            }
            // A worker just went idle; loop around so the handoff arm
            // below becomes eligible.
            _ = self.shared.worker_idle.notified(), if !ready => {}
            permit = worker_tx.reserve(), if ready => {
                if let Ok(permit) = permit {
                    if let Some(queued) = self.pop_front() {
                        permit.send(Some(queued));
                    }
                }
            }
        }

        true
    }

    /// Spawns a worker, optionally with its first task pre-assigned.
    fn spawn_worker(&mut self, first: Option<Arc<QueuedTask>>) {
        let queue = Arc::clone(&self.worker_rx);
        let shared = Arc::clone(&self.shared);

        self.workers.push(tokio::spawn(async move {
            if let Some(queued) = first {
                queued.run().await;
            }

            loop {
                shared.idle_workers.fetch_add(1, Ordering::AcqRel);
                shared.worker_idle.notify_one();
                let msg = { queue.lock().await.recv().await };
                shared.idle_workers.fetch_sub(1, Ordering::AcqRel);

                match msg {
                    Some(Some(queued)) => queued.run().await,
                    // A `None` task or a closed queue kills the worker.
                    _ => return,
                }
            }
        }));
    }

    /// Drains the waiting queue (to workers or via cancellation), kills
    /// the workers and waits for them.
    async fn shutdown(mut self) {
        let to_cancel = !self.shared.wait_before_shutdown.load(Ordering::Acquire);

        while let Some(queued) = self.pop_front() {
            if to_cancel {
                queued.cancel();
            } else {
                let _ = self.worker_tx.send(Some(queued)).await;
            }
        }

        for _ in 0..self.worker_count {
            let _ = self.worker_tx.send(None).await;
        }
        self.worker_count = 0;

        for worker in self.workers.drain(..) {
            let _ = worker.await;
        }

        debug!("worker pool dispatcher exited");
        self.shared.stopped_chan.cancel();
    }

    fn push_back(&mut self, queued: Arc<QueuedTask>) -> usize {
        self.waiting.push_back(queued);
        let len = self.waiting.len();
        self.shared.pending_size.store(len, Ordering::Release);
        len
    }

    fn pop_front(&mut self) -> Option<Arc<QueuedTask>> {
        let queued = self.waiting.pop_front();
        self.shared
            .pending_size
            .store(self.waiting.len(), Ordering::Release);
        queued
    }
}
