//! Unit tests for the partitioner.

use crate::context::Context;
use crate::fork_join::wait_all;
use crate::partitioner::Partitioner;
use crate::task::SilentTask;

#[tokio::test]
async fn groups_items_by_key() {
    let ctx = Context::background();
    let partitioner = Partitioner::new(&ctx, |n: &i32| Some(n % 3));

    partitioner.take((0..9).collect()).wait().await;

    let groups = partitioner.outcome();
    assert_eq!(groups[&0], vec![0, 3, 6]);
    assert_eq!(groups[&1], vec![1, 4, 7]);
    assert_eq!(groups[&2], vec![2, 5, 8]);
}

#[tokio::test]
async fn items_without_a_key_are_dropped() {
    let ctx = Context::background();
    let partitioner = Partitioner::new(&ctx, |n: &i32| (*n >= 0).then_some("non-negative"));

    partitioner.take(vec![-2, -1, 0, 1, 2]).wait().await;

    let groups = partitioner.outcome();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups["non-negative"], vec![0, 1, 2]);
}

#[tokio::test]
async fn outcome_resets_internal_state() {
    let ctx = Context::background();
    let partitioner = Partitioner::new(&ctx, |s: &&str| Some(s.len()));

    partitioner.take(vec!["a", "bb"]).wait().await;
    let first = partitioner.outcome();
    assert_eq!(first.len(), 2);

    let second = partitioner.outcome();
    assert!(second.is_empty());

    partitioner.take(vec!["ccc"]).wait().await;
    let third = partitioner.outcome();
    assert_eq!(third[&3], vec!["ccc"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_takes_merge_into_shared_groups() {
    let ctx = Context::background();
    let partitioner = Partitioner::new(&ctx, |n: &u32| Some(n % 2));

    let tasks: Vec<_> = (0..8u32)
        .map(|i| partitioner.take(vec![i * 2, i * 2 + 1]))
        .collect();
    wait_all(&tasks).await;

    let groups = partitioner.outcome();
    assert_eq!(groups[&0].len(), 8);
    assert_eq!(groups[&1].len(), 8);
}
