//! Fork/join: start a batch of tasks and wait for all of them.

use crate::context::Context;
use crate::task::{SilentTask, Task};

/// Executes the given tasks in parallel and waits for ALL of them to
/// terminate before the returned task completes.
///
/// Outcomes stay with the individual tasks; the join itself never fails
/// and never exits early.
///
/// # Examples
///
/// ```
/// use taskx::{fork_join, Context, SilentTask, Task};
///
/// # async {
/// let ctx = Context::background();
/// let tasks = Task::new_many((0..4).map(|i| move |_ctx| async move { Ok(i * 10) }));
/// fork_join(&ctx, tasks.clone()).wait().await;
/// assert_eq!(tasks[3].outcome().await, Ok(30));
/// # };
/// ```
pub fn fork_join<T>(ctx: &Context, tasks: Vec<T>) -> Task<()>
where
    T: SilentTask + 'static,
{
    Task::invoke_silent(ctx, move |task_ctx| async move {
        for task in &tasks {
            task.execute(&task_ctx);
        }

        wait_all(&tasks).await;
        Ok(())
    })
}

/// Waits for every executed task to reach a terminal state.
pub async fn wait_all<T: SilentTask>(tasks: &[T]) {
    for task in tasks {
        task.wait().await;
    }
}

/// Cancels every given task.
pub fn cancel_all<T: SilentTask>(tasks: &[T]) {
    for task in tasks {
        task.cancel();
    }
}

#[cfg(test)]
mod tests;
