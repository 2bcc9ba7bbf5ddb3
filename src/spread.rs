//! Time-even spreading of task starts.

use std::time::Duration;

use crate::context::Context;
use crate::error::Error;
use crate::fork_join::{cancel_all, wait_all};
use crate::task::{SilentTask, Task};

/// Starts one task every `within / N`, spreading the batch evenly across
/// the window, then waits for all of them.
///
/// On context cancellation the untouched tail is cancelled and the run
/// fails with [`Error::Cancelled`].
pub fn spread<T>(ctx: &Context, tasks: Vec<T>, within: Duration) -> Task<()>
where
    T: SilentTask + 'static,
{
    Task::invoke_silent(ctx, move |task_ctx| async move {
        let pause = within / tasks.len().max(1) as u32;

        for (i, task) in tasks.iter().enumerate() {
            if task_ctx.is_done() {
                cancel_all(&tasks[i..]);
                return Err(Error::Cancelled);
            }

            task.execute(&task_ctx);
            tokio::time::sleep(pause).await;
        }

        wait_all(&tasks).await;
        Ok(())
    })
}
