pub mod assert;
pub mod async_queue;
pub mod backoff;
pub mod sorted_map;
pub mod sorted_set;

pub use assert::{assertion_error, fail, hard_assert};
pub use async_queue::{box_queue_future, AsyncQueue, DelayedOperation, QueueFuture, TimerId};
pub use backoff::{BackoffSettings, ExponentialBackoff, RANDOM_FACTOR};
pub use sorted_map::{Comparator, SortedMap, SortedMapIter};
pub use sorted_set::{SortedSet, SortedSetIter};
