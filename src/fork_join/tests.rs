//! Unit tests for fork/join.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::context::Context;
use crate::error::Error;
use crate::fork_join::{cancel_all, fork_join, wait_all};
use crate::task::{SilentTask, State, Task};

#[tokio::test]
async fn runs_every_task_and_waits_for_all() {
    let ctx = Context::background();
    let completed = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<Task<()>> = (0..10)
        .map(|_| {
            let completed = Arc::clone(&completed);
            Task::new_silent(move |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                completed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
        .collect();

    let join = fork_join(&ctx, tasks.clone());
    join.wait().await;

    assert_eq!(completed.load(Ordering::SeqCst), 10);
    for task in &tasks {
        assert_eq!(task.state(), State::Completed);
    }
}

#[tokio::test]
async fn task_errors_stay_with_their_task() {
    let ctx = Context::background();
    let ok_task = Task::new(|_ctx| async { Ok(1) });
    let failing = Task::new(|_ctx| async { Err(Error::msg("one bad apple")) });

    let join = fork_join(&ctx, vec![ok_task.clone(), failing.clone()]);

    // The join itself succeeds; the failure is observable per task.
    assert!(join.error().await.is_none());
    assert_eq!(ok_task.outcome().await, Ok(1));
    assert!(failing.outcome().await.is_err());
}

#[tokio::test]
async fn wait_all_returns_once_every_task_is_terminal() {
    let ctx = Context::background();
    let tasks = Task::new_many((0..4).map(|i| {
        move |_ctx| async move {
            tokio::time::sleep(Duration::from_millis(5 * i as u64)).await;
            Ok(i)
        }
    }));

    for task in &tasks {
        task.run(&ctx);
    }
    wait_all(&tasks).await;

    for task in &tasks {
        assert!(task.state().is_terminal());
    }
}

#[tokio::test]
async fn cancel_all_cancels_unstarted_tasks() {
    let tasks: Vec<Task<i32>> = Task::new_many((0..3).map(|i| move |_ctx| async move { Ok(i) }));
    cancel_all(&tasks);

    for task in &tasks {
        assert_eq!(task.state(), State::Cancelled);
    }
}
