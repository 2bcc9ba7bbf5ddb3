//! Concurrent partitioning of items into keyed groups.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;

use crate::context::Context;
use crate::task::Task;

type PartitionFn<K, V> = Arc<dyn Fn(&V) -> Option<K> + Send + Sync>;

/// Divides items into separate partitions keyed by a client-supplied
/// function. Items for which the function returns `None` are dropped.
///
/// `take` calls merge concurrently into shared state; `outcome` snapshots
/// the accumulated groups and resets the partitioner.
///
/// # Examples
///
/// ```
/// use taskx::{Context, Partitioner, SilentTask};
///
/// # async {
/// let ctx = Context::background();
/// let partitioner = Partitioner::new(&ctx, |n: &i32| Some(n % 2));
///
/// partitioner.take(vec![1, 2, 3, 4]).wait().await;
///
/// let groups = partitioner.outcome();
/// assert_eq!(groups[&0], vec![2, 4]);
/// assert_eq!(groups[&1], vec![1, 3]);
/// # };
/// ```
pub struct Partitioner<K, V> {
    ctx: Context,
    partition_fn: PartitionFn<K, V>,
    partitions: Arc<DashMap<K, Vec<V>>>,
}

impl<K, V> Partitioner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Creates a partitioner that routes values through `partition_fn`.
    pub fn new<F>(ctx: &Context, partition_fn: F) -> Self
    where
        F: Fn(&V) -> Option<K> + Send + Sync + 'static,
    {
        Self {
            ctx: ctx.clone(),
            partition_fn: Arc::new(partition_fn),
            partitions: Arc::new(DashMap::new()),
        }
    }

    /// Takes items and divides them into partitions asynchronously. The
    /// returned task completes once the items have been merged.
    pub fn take(&self, items: Vec<V>) -> Task<()> {
        let partition_fn = Arc::clone(&self.partition_fn);
        let partitions = Arc::clone(&self.partitions);

        Task::invoke_silent(&self.ctx, move |_ctx| async move {
            let mut grouped: HashMap<K, Vec<V>> = HashMap::new();
            for item in items {
                if let Some(key) = partition_fn(&item) {
                    grouped.entry(key).or_default().push(item);
                }
            }

            for (key, group) in grouped {
                partitions.entry(key).or_default().extend(group);
            }

            Ok(())
        })
    }

    /// Returns the accumulated partitions and resets internal state.
    pub fn outcome(&self) -> HashMap<K, Vec<V>> {
        let keys: Vec<K> = self
            .partitions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some((key, group)) = self.partitions.remove(&key) {
                out.insert(key, group);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests;
