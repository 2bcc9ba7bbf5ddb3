//! Worker-pool scenarios: bounded fairness and burst expansion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use taskx::{Context, SilentTask, Task, WorkerPool};

/// Tracks how many tasks are running at once.
struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Gauge {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    fn running(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// A task that parks until `release` flips, counting itself as running.
fn parked_task(gauge: &Arc<Gauge>, release: tokio::sync::watch::Receiver<bool>) -> Task<()> {
    let gauge = Arc::clone(gauge);
    let mut release = release;
    Task::new_silent(move |_ctx| async move {
        let now = gauge.current.fetch_add(1, Ordering::SeqCst) + 1;
        gauge.peak.fetch_max(now, Ordering::SeqCst);

        while !*release.borrow_and_update() {
            if release.changed().await.is_err() {
                break;
            }
        }

        gauge.current.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn at_most_max_size_tasks_run_concurrently() {
    let pool = WorkerPool::builder().max_size(5).build();
    let ctx = Context::background();
    let gauge = Gauge::new();
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let task = parked_task(&gauge, release_rx.clone());
        tasks.push(task.clone());
        pool.submit(&ctx, task).await;
    }

    // Exactly five workers start; the other five wait in the queue.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gauge.running(), 5);
    assert_eq!(pool.waiting_queue_size(), 5);

    release_tx.send(true).unwrap();
    for task in &tasks {
        task.wait().await;
    }

    assert_eq!(gauge.peak(), 5);
    assert_eq!(pool.waiting_queue_size(), 0);

    pool.stop_wait().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn burst_expansion_grows_the_pool_beyond_max_size() {
    let pool = WorkerPool::builder().max_size(5).burst(10, 5).build();
    let ctx = Context::background();
    let gauge = Gauge::new();
    let (release_tx, release_rx) = tokio::sync::watch::channel(false);

    let mut tasks = Vec::new();
    for _ in 0..15 {
        let task = parked_task(&gauge, release_rx.clone());
        tasks.push(task.clone());
        pool.submit(&ctx, task).await;
    }

    // The waiting queue hits the burst threshold, adding five workers.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while gauge.running() < 10 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(gauge.running(), 10);
    assert_eq!(pool.waiting_queue_size(), 5);

    release_tx.send(true).unwrap();
    for task in &tasks {
        task.wait().await;
    }

    // Burst workers never push concurrency past max + burst capacity.
    assert!(gauge.peak() <= 10, "peak {} exceeded the burst bound", gauge.peak());

    pool.stop_wait().await;
}
