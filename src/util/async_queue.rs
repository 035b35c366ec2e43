//! Serialised execution of async operations plus cancellable delayed tasks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::future::{self, Either};
use futures::FutureExt;

use crate::platform::runtime;

#[cfg(target_arch = "wasm32")]
pub type QueueFuture = futures::future::LocalBoxFuture<'static, ()>;
#[cfg(not(target_arch = "wasm32"))]
pub type QueueFuture = futures::future::BoxFuture<'static, ()>;

#[cfg(target_arch = "wasm32")]
pub fn box_queue_future<F>(future: F) -> QueueFuture
where
    F: Future<Output = ()> + 'static,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn box_queue_future<F>(future: F) -> QueueFuture
where
    F: Future<Output = ()> + Send + 'static,
{
    future.boxed()
}

/// Identifies delayed operations so tests can fast-forward a specific timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    LruGarbageCollection,
    /// Re-enabling the network after a local storage failure.
    AsyncQueueRetry,
}

struct DelayedState {
    timer_id: TimerId,
    cancelled: AtomicBool,
    finished: AtomicBool,
    fire_now: Sender<()>,
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    state: Arc<DelayedState>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.state.timer_id
    }

    /// Prevents the operation from running. Has no effect once it started.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        let _ = self.state.fire_now.try_send(());
    }

    /// Runs the operation as soon as the queue is free instead of waiting.
    pub fn skip_delay(&self) {
        let _ = self.state.fire_now.try_send(());
    }

    pub fn is_pending(&self) -> bool {
        !self.state.cancelled.load(Ordering::SeqCst) && !self.state.finished.load(Ordering::SeqCst)
    }
}

struct AsyncQueueInner {
    gate: async_lock::Mutex<()>,
    delayed: Mutex<Vec<DelayedOperation>>,
    shut_down: AtomicBool,
}

impl AsyncQueueInner {
    fn lock_delayed(&self) -> std::sync::MutexGuard<'_, Vec<DelayedOperation>> {
        match self.delayed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Runs enqueued operations one at a time, in submission order.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AsyncQueueInner {
                gate: async_lock::Mutex::new(()),
                delayed: Mutex::new(Vec::new()),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    /// Runs `operation` once every previously enqueued operation has finished.
    ///
    /// Returns `None` when the queue has been shut down.
    pub async fn enqueue<F, T>(&self, operation: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        if self.is_shut_down() {
            return None;
        }
        let _guard = self.inner.gate.lock().await;
        Some(operation.await)
    }

    /// Runs `operation` even when the queue is shutting down. Used for the
    /// shutdown sequence itself.
    pub async fn enqueue_even_while_shut_down<F, T>(&self, operation: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.inner.gate.lock().await;
        operation.await
    }

    /// Marks the queue as shut down and cancels every pending delayed
    /// operation.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);
        let delayed = {
            let mut guard = self.inner.lock_delayed();
            std::mem::take(&mut *guard)
        };
        for operation in delayed {
            operation.cancel();
        }
    }

    /// Schedules `operation` to run on the queue after `delay`.
    pub fn enqueue_after_delay<F>(&self, timer_id: TimerId, delay: Duration, operation: F) -> DelayedOperation
    where
        F: FnOnce() -> QueueFuture + Send + 'static,
    {
        let (fire_now, fired): (Sender<()>, Receiver<()>) = async_channel::bounded(1);
        let handle = DelayedOperation {
            state: Arc::new(DelayedState {
                timer_id,
                cancelled: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                fire_now,
            }),
        };
        {
            let mut guard = self.inner.lock_delayed();
            guard.retain(DelayedOperation::is_pending);
            guard.push(handle.clone());
        }

        let queue = self.clone();
        let state = Arc::clone(&handle.state);
        runtime::spawn_detached(async move {
            let timer = Box::pin(runtime::sleep(delay));
            let early = Box::pin(async move {
                let _ = fired.recv().await;
            });
            if let Either::Right(_) = future::select(timer, early).await {
                log::debug!("delayed operation {:?} fired early", state.timer_id);
            }
            if state.cancelled.load(Ordering::SeqCst) || queue.is_shut_down() {
                return;
            }
            let _guard = queue.inner.gate.lock().await;
            if state.cancelled.load(Ordering::SeqCst) {
                return;
            }
            state.finished.store(true, Ordering::SeqCst);
            operation().await;
        });
        handle
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        let guard = self.inner.lock_delayed();
        guard
            .iter()
            .any(|operation| operation.timer_id() == timer_id && operation.is_pending())
    }

    /// Fires every pending delayed operation with the given timer id
    /// immediately.
    pub fn run_delayed_operations_early(&self, timer_id: TimerId) {
        let guard = self.inner.lock_delayed();
        for operation in guard.iter().filter(|op| op.timer_id() == timer_id) {
            operation.skip_delay();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn enqueue_runs_in_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for index in 0..3 {
            let log = Arc::clone(&log);
            queue
                .enqueue(async move {
                    log.lock().unwrap().push(index);
                })
                .await;
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn shut_down_queue_rejects_work() {
        let queue = AsyncQueue::new();
        queue.shutdown();
        assert!(queue.enqueue(async { 1 }).await.is_none());
        assert_eq!(queue.enqueue_even_while_shut_down(async { 2 }).await, 2);
    }

    #[tokio::test]
    async fn delayed_operation_can_be_cancelled() {
        let queue = AsyncQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let task_counter = Arc::clone(&counter);
        let operation = queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_millis(20), move || {
            box_queue_future(async move {
                task_counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        operation.cancel();
        runtime::sleep(Duration::from_millis(60)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!queue.contains_delayed_operation(TimerId::ListenStreamIdle));
    }

    #[tokio::test]
    async fn delayed_operation_can_run_early() {
        let queue = AsyncQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let task_counter = Arc::clone(&counter);
        queue.enqueue_after_delay(TimerId::WriteStreamConnectionBackoff, Duration::from_secs(3_600), move || {
            box_queue_future(async move {
                task_counter.fetch_add(1, Ordering::SeqCst);
            })
        });
        assert!(queue.contains_delayed_operation(TimerId::WriteStreamConnectionBackoff));
        queue.run_delayed_operations_early(TimerId::WriteStreamConnectionBackoff);
        for _ in 0..20 {
            if counter.load(Ordering::SeqCst) == 1 {
                break;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
