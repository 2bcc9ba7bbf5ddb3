//! Periodic repetition with per-tick panic recovery.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::MissedTickBehavior;
use tracing::error;

use crate::context::Context;
use crate::error::{Error, TaskResult};
use crate::task::Task;

/// Fires `action` on a fixed interval until the context is done.
///
/// The first tick fires one interval after the call. A tick that runs
/// longer than the interval delays nothing afterwards: missed ticks are
/// skipped, never replayed. Errors and panics raised by a tick are
/// logged and do not stop the repeater.
pub fn repeat<F, Fut>(ctx: &Context, interval: Duration, action: F) -> Task<()>
where
    F: Fn(Context) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<()>> + Send + 'static,
{
    Task::invoke_silent(ctx, move |task_ctx| async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = task_ctx.done() => return Ok(()),
                _ = ticker.tick() => {
                    let result = AssertUnwindSafe(action(task_ctx.clone()))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|payload| Err(Error::panicked(payload)));

                    if let Err(err) = result {
                        error!(%err, "error repeating task");
                    }
                }
            }
        }
    })
}
