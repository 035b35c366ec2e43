use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::firestore::constants::CACHE_SIZE_UNLIMITED;
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::lru_garbage_collector::{INITIAL_GC_DELAY, REGULAR_GC_DELAY};
use crate::util::{box_queue_future, AsyncQueue, DelayedOperation, TimerId};

/// Runs LRU garbage collection on the async queue, first after
/// [`INITIAL_GC_DELAY`] and then every [`REGULAR_GC_DELAY`].
pub struct LruScheduler {
    queue: AsyncQueue,
    local_store: Weak<LocalStore>,
    gc_task: Mutex<Option<DelayedOperation>>,
}

impl LruScheduler {
    pub fn new(queue: AsyncQueue, local_store: &Arc<LocalStore>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            local_store: Arc::downgrade(local_store),
            gc_task: Mutex::new(None),
        })
    }

    /// Arms the first collection. Does nothing when collection is disabled.
    pub fn start(self: &Arc<Self>) {
        let Some(local_store) = self.local_store.upgrade() else {
            return;
        };
        if local_store.lru_params().cache_size_collection_threshold == CACHE_SIZE_UNLIMITED {
            log::debug!("garbage collection disabled; not scheduling");
            return;
        }
        self.schedule_gc(INITIAL_GC_DELAY);
    }

    /// Cancels the pending collection, if any.
    pub fn stop(&self) {
        if let Some(task) = self.lock_task().take() {
            task.cancel();
        }
    }

    pub fn is_started(&self) -> bool {
        self.lock_task().as_ref().is_some_and(DelayedOperation::is_pending)
    }

    fn schedule_gc(self: &Arc<Self>, delay: Duration) {
        if self.queue.is_shut_down() {
            return;
        }
        log::debug!("garbage collection scheduled in {}s", delay.as_secs());
        let scheduler = Arc::downgrade(self);
        let task = self
            .queue
            .enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || {
                box_queue_future(async move {
                    let Some(scheduler) = scheduler.upgrade() else {
                        return;
                    };
                    if let Some(local_store) = scheduler.local_store.upgrade() {
                        let results = local_store.collect_garbage().await;
                        if results.did_run {
                            log::debug!(
                                "garbage collection removed {} documents and {} targets",
                                results.documents_removed,
                                results.targets_removed
                            );
                        }
                    }
                    scheduler.schedule_gc(REGULAR_GC_DELAY);
                })
            });
        *self.lock_task() = Some(task);
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<DelayedOperation>> {
        match self.gc_task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::LruParams;
    use crate::firestore::model::{
        DocumentKey, FieldPath, Mutation, MutationBatchResult, MutationResult, ObjectValue, SnapshotVersion, Timestamp,
    };
    use crate::firestore::value::FirestoreValue;
    use crate::platform::runtime;
    use crate::platform::token::User;

    fn key(index: usize) -> DocumentKey {
        DocumentKey::from_string(&format!("rooms/r{index}")).unwrap()
    }

    /// Writes and acknowledges one document per index, leaving each cached
    /// without any target holding it.
    async fn acknowledged_documents(store: &LocalStore, count: usize) {
        for index in 0..count {
            let mut data = ObjectValue::empty();
            data.set(
                &FieldPath::from_dot_separated("n").unwrap(),
                FirestoreValue::from_integer(index as i64),
            );
            store
                .write_locally(vec![Mutation::set(key(index), data)])
                .await
                .unwrap();
            let batch = store.next_mutation_batch(None).await.unwrap();
            let version = SnapshotVersion::new(Timestamp::new(index as i64 + 1, 0));
            let result = MutationBatchResult::from(
                batch,
                version,
                vec![MutationResult::new(version, Vec::new())],
                Vec::new(),
            );
            store.acknowledge_batch(result).await.unwrap();
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn scheduled_collection_evicts_and_rearms() {
        let queue = AsyncQueue::new();
        let mut params = LruParams::with_cache_size(1);
        params.percentile_to_collect = 50;
        let store = Arc::new(LocalStore::new(&User::unauthenticated(), params));
        acknowledged_documents(&store, 4).await;
        assert!(store.read_document(&key(0)).await.is_found_document());

        let scheduler = LruScheduler::new(queue.clone(), &store);
        scheduler.start();
        assert!(queue.contains_delayed_operation(TimerId::LruGarbageCollection));
        queue.run_delayed_operations_early(TimerId::LruGarbageCollection);

        let mut evicted = false;
        for _ in 0..400 {
            if !store.read_document(&key(0)).await.is_valid_document() {
                evicted = true;
                break;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        assert!(evicted, "the oldest document is collected");
        assert!(store.read_document(&key(3)).await.is_found_document());

        wait_until(|| scheduler.is_started()).await;
        assert!(queue.contains_delayed_operation(TimerId::LruGarbageCollection));
        scheduler.stop();
        assert!(!queue.contains_delayed_operation(TimerId::LruGarbageCollection));
    }

    #[tokio::test]
    async fn disabled_collection_is_never_scheduled() {
        let queue = AsyncQueue::new();
        let store = Arc::new(LocalStore::new(&User::unauthenticated(), LruParams::disabled()));
        let scheduler = LruScheduler::new(queue.clone(), &store);
        scheduler.start();
        assert!(!scheduler.is_started());
        assert!(!queue.contains_delayed_operation(TimerId::LruGarbageCollection));
    }

    #[tokio::test]
    async fn shutting_down_the_queue_cancels_collection() {
        let queue = AsyncQueue::new();
        let store = Arc::new(LocalStore::new(&User::unauthenticated(), LruParams::with_cache_size(1)));
        let scheduler = LruScheduler::new(queue.clone(), &store);
        scheduler.start();
        assert!(scheduler.is_started());
        queue.shutdown();
        assert!(!scheduler.is_started());
        scheduler.schedule_gc(REGULAR_GC_DELAY);
        assert!(!scheduler.is_started());
    }
}
