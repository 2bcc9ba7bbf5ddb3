//! Unit tests for throttled execution.

use std::time::{Duration, Instant};

use crate::context::Context;
use crate::error::Error;
use crate::task::{SilentTask, State, Task};
use crate::throttle::throttle;

#[tokio::test]
async fn releases_tasks_at_the_configured_rate() {
    let ctx = Context::background();
    let tasks: Vec<Task<()>> = (0..6)
        .map(|_| Task::new_silent(|_ctx| async { Ok(()) }))
        .collect();

    let started = Instant::now();
    let run = throttle(&ctx, tasks.clone(), 2, Duration::from_millis(100));
    assert!(run.error().await.is_none());

    // 6 tasks at 2 per 100ms: the last release waits ~250ms after the
    // first (interval fires immediately, then every 50ms).
    assert!(started.elapsed() >= Duration::from_millis(200));
    for task in &tasks {
        assert_eq!(task.state(), State::Completed);
    }
}

#[tokio::test]
async fn cancellation_cancels_the_untouched_tail() {
    let ctx = Context::background().child();
    let tasks: Vec<Task<()>> = (0..100)
        .map(|_| Task::new_silent(|_ctx| async { Ok(()) }))
        .collect();

    let run = throttle(&ctx, tasks.clone(), 1, Duration::from_secs(10));

    tokio::time::sleep(Duration::from_millis(50)).await;
    ctx.cancel();

    assert!(matches!(run.error().await, Some(Error::Cancelled)));
    assert!(tasks.iter().any(|t| t.state() == State::Cancelled));
}

#[tokio::test]
async fn deadline_cancellation_uses_the_fixed_sentinel_for_the_tail() {
    let ctx = Context::background().with_timeout(Duration::from_millis(40));
    let tasks: Vec<Task<()>> = (0..50)
        .map(|_| Task::new_silent(|_ctx| async { Ok(()) }))
        .collect();

    let run = throttle(&ctx, tasks.clone(), 1, Duration::from_secs(10));

    let err = run.error().await.expect("the deadline should fail the run");
    assert!(err.is_cancellation());

    // The untouched tail is cancelled outright rather than deadlined.
    let last = tasks.last().unwrap();
    assert_eq!(last.state(), State::Cancelled);
    assert_eq!(last.outcome().await, Err(Error::Cancelled));
}
