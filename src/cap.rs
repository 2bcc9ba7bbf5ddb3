//! Concurrency-capped execution of task batches, in slice and stream
//! form.

use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::context::Context;
use crate::error::Error;
use crate::fork_join::{cancel_all, wait_all};
use crate::task::{SilentTask, Task};

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Runs the given tasks with at most `concurrency` of them in flight at
/// once. A `concurrency` of 0 means the host's available parallelism.
///
/// If the context is cancelled mid-iteration, the not-yet-started tail
/// is cancelled and the run fails with [`Error::Cancelled`], whatever
/// made the context done.
pub fn run_with_concurrency<T>(ctx: &Context, concurrency: usize, tasks: Vec<T>) -> Task<()>
where
    T: SilentTask + Clone + 'static,
{
    let concurrency = if concurrency == 0 {
        default_concurrency()
    } else {
        concurrency
    };

    Task::invoke_silent(ctx, move |task_ctx| async move {
        let semaphore = Arc::new(Semaphore::new(concurrency));

        for (i, task) in tasks.iter().enumerate() {
            tokio::select! {
                biased;
                _ = task_ctx.done() => {
                    cancel_all(&tasks[i..]);
                    return Err(Error::Cancelled);
                }
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    let Ok(permit) = permit else { break };
                    task.execute(&task_ctx);

                    // The permit travels with the continuation and frees
                    // a slot once the task terminates.
                    let running = task.clone();
                    tokio::spawn(async move {
                        running.wait().await;
                        drop(permit);
                    });
                }
            }
        }

        wait_all(&tasks).await;
        Ok(())
    })
}

/// Consumes tasks from a channel with at most `concurrency` of them in
/// flight at once. A `concurrency` of 0 means the host's available
/// parallelism.
///
/// When the channel closes, in-flight tasks are awaited and the returned
/// task completes. When the context is cancelled, the remainder of the
/// channel is drained and cancelled asynchronously, in-flight tasks are
/// awaited, and the context error is returned. Ties between an available
/// worker and a cancelled context resolve in favor of cancellation.
pub fn run_with_concurrency_stream<T>(
    ctx: &Context,
    concurrency: usize,
    tasks: mpsc::Receiver<T>,
) -> Task<()>
where
    T: SilentTask + Clone + 'static,
{
    let concurrency = if concurrency == 0 {
        default_concurrency()
    } else {
        concurrency
    };

    Task::invoke_silent(ctx, move |task_ctx| async move {
        let mut tasks = tasks;

        let (workers_tx, mut workers_rx) = mpsc::channel::<usize>(concurrency);
        for id in 0..concurrency {
            let _ = workers_tx.send(id).await;
        }

        let mut in_flight: Vec<Option<T>> = (0..concurrency).map(|_| None).collect();

        loop {
            tokio::select! {
                biased;
                _ = task_ctx.done() => {
                    drain_and_cancel(tasks);
                    wait_in_flight(&in_flight).await;
                    return Err(task_ctx.error());
                }
                worker = workers_rx.recv() => {
                    // The sender half lives in this scope, so the worker
                    // channel can never be closed here.
                    let Some(worker) = worker else { break };

                    tokio::select! {
                        biased;
                        _ = task_ctx.done() => {
                            drain_and_cancel(tasks);
                            wait_in_flight(&in_flight).await;
                            return Err(task_ctx.error());
                        }
                        next = tasks.recv() => match next {
                            None => {
                                wait_in_flight(&in_flight).await;
                                return Ok(());
                            }
                            Some(task) => {
                                in_flight[worker] = Some(task.clone());
                                task.execute(&task_ctx);

                                // Return the worker slot once the task
                                // terminates.
                                let running = task;
                                let slots = workers_tx.clone();
                                tokio::spawn(async move {
                                    running.wait().await;
                                    let _ = slots.send(worker).await;
                                });
                            }
                        }
                    }
                }
            }
        }

        wait_in_flight(&in_flight).await;
        Ok(())
    })
}

/// Cancels everything still in (or later arriving on) the channel,
/// off the caller's execution path.
fn drain_and_cancel<T: SilentTask + 'static>(mut tasks: mpsc::Receiver<T>) {
    tokio::spawn(async move {
        while let Some(task) = tasks.recv().await {
            task.cancel();
        }
    });
}

async fn wait_in_flight<T: SilentTask>(in_flight: &[Option<T>]) {
    for task in in_flight.iter().flatten() {
        task.wait().await;
    }
}
