//! Rate-limited task release.

use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::context::Context;
use crate::error::Error;
use crate::fork_join::{cancel_all, wait_all};
use crate::task::{SilentTask, Task};

/// Starts the given tasks at a rate of `rate_limit` per `every`,
/// token-bucket style, then waits for all of them.
///
/// On context cancellation the untouched tail is cancelled and the run
/// fails with [`Error::Cancelled`]. Member-task errors are not
/// aggregated; they stay with the individual tasks.
pub fn throttle<T>(ctx: &Context, tasks: Vec<T>, rate_limit: usize, every: Duration) -> Task<()>
where
    T: SilentTask + 'static,
{
    let period = every / rate_limit.max(1) as u32;

    Task::invoke_silent(ctx, move |task_ctx| async move {
        let mut limiter = tokio::time::interval(period);
        limiter.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for (i, task) in tasks.iter().enumerate() {
            tokio::select! {
                biased;
                _ = task_ctx.done() => {
                    cancel_all(&tasks[i..]);
                    return Err(Error::Cancelled);
                }
                _ = limiter.tick() => task.execute(&task_ctx),
            }
        }

        wait_all(&tasks).await;
        Ok(())
    })
}

#[cfg(test)]
mod tests;
