//! Random jitter around task execution.
//!
//! Jitter spreads out thundering herds: a uniform random delay in
//! `[0, max]` milliseconds is drawn before the work starts.

use std::time::Duration;

use rand::Rng;

use crate::task::{SilentTask, Task};

/// Sleeps a uniform random duration in `[0, max_jitter_ms]` milliseconds,
/// runs `do_fn`, and returns the chosen delay in milliseconds.
pub async fn do_jitter<F: FnOnce()>(do_fn: F, max_jitter_ms: u64) -> u64 {
    let delay = wait_for_random_jitter(max_jitter_ms).await;
    do_fn();
    delay
}

/// Wraps a task so that its work is preceded by a uniform random sleep in
/// `[0, max_jitter_ms]` milliseconds.
pub fn add_jitter<T>(task: &Task<T>, max_jitter_ms: u64) -> Task<T>
where
    T: Clone + Send + Sync + 'static,
{
    let inner = task.clone();
    Task::new(move |ctx| async move {
        wait_for_random_jitter(max_jitter_ms).await;

        inner.run(&ctx);
        inner.outcome().await
    })
}

/// Silent-task variant of [`add_jitter`].
pub fn add_jitter_silent<T>(task: &T, max_jitter_ms: u64) -> Task<()>
where
    T: SilentTask + Clone + 'static,
{
    let inner = task.clone();
    Task::new_silent(move |ctx| async move {
        wait_for_random_jitter(max_jitter_ms).await;

        inner.execute(&ctx);
        match inner.error().await {
            Some(err) => Err(err),
            None => Ok(()),
        }
    })
}

async fn wait_for_random_jitter(max_jitter_ms: u64) -> u64 {
    let delay = rand::thread_rng().gen_range(0..=max_jitter_ms);
    tokio::time::sleep(Duration::from_millis(delay)).await;
    delay
}
