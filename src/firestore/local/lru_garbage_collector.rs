use std::collections::{BinaryHeap, HashSet};
use std::time::Duration;

use crate::firestore::constants::CACHE_SIZE_UNLIMITED;
use crate::firestore::core::target::TargetId;
use crate::firestore::core::types::{ListenSequenceNumber, INVALID_SEQUENCE_NUMBER};
use crate::firestore::local::persistence::MemoryPersistence;

/// Delay before the first collection after start-up.
pub const INITIAL_GC_DELAY: Duration = Duration::from_secs(60);

/// Delay between later collections.
pub const REGULAR_GC_DELAY: Duration = Duration::from_secs(5 * 60);

const DEFAULT_PERCENTILE_TO_COLLECT: usize = 10;
const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LruParams {
    /// Cache size above which collection runs, or `CACHE_SIZE_UNLIMITED`.
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: usize,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl LruParams {
    pub fn with_cache_size(cache_size_bytes: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size_bytes,
            percentile_to_collect: DEFAULT_PERCENTILE_TO_COLLECT,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(CACHE_SIZE_UNLIMITED)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

/// Evicts the least recently used targets and documents once the cache
/// grows past its configured size.
#[derive(Clone, Debug)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> LruParams {
        self.params
    }

    /// How many sequence numbers make up `percentile` of the cache.
    pub fn calculate_target_count(&self, persistence: &MemoryPersistence, percentile: usize) -> usize {
        persistence.sequence_number_count() * percentile / 100
    }

    /// The `n`th smallest sequence number in the cache.
    pub fn nth_sequence_number(&self, persistence: &MemoryPersistence, n: usize) -> ListenSequenceNumber {
        if n == 0 {
            return INVALID_SEQUENCE_NUMBER;
        }
        // Max-heap holding the n smallest values seen so far.
        let mut smallest = BinaryHeap::with_capacity(n);
        for sequence_number in persistence.sequence_numbers() {
            if smallest.len() < n {
                smallest.push(sequence_number);
            } else if smallest.peek().is_some_and(|largest| sequence_number < *largest) {
                smallest.pop();
                smallest.push(sequence_number);
            }
        }
        smallest.peek().copied().unwrap_or(INVALID_SEQUENCE_NUMBER)
    }

    /// Runs a collection pass when enabled and the cache is over budget.
    /// Targets in `active_target_ids` are never removed.
    pub fn collect(&self, persistence: &mut MemoryPersistence, active_target_ids: &HashSet<TargetId>) -> LruResults {
        if self.params.cache_size_collection_threshold == CACHE_SIZE_UNLIMITED {
            log::debug!("garbage collection skipped; disabled");
            return LruResults::default();
        }
        let cache_size = persistence.byte_size() as i64;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return LruResults::default();
        }
        self.run_garbage_collection(persistence, active_target_ids)
    }

    fn run_garbage_collection(
        &self,
        persistence: &mut MemoryPersistence,
        active_target_ids: &HashSet<TargetId>,
    ) -> LruResults {
        let mut sequence_numbers_to_collect =
            self.calculate_target_count(persistence, self.params.percentile_to_collect);
        if sequence_numbers_to_collect > self.params.maximum_sequence_numbers_to_collect {
            log::debug!(
                "capping sequence numbers to collect down to the maximum of {} from {sequence_numbers_to_collect}",
                self.params.maximum_sequence_numbers_to_collect
            );
            sequence_numbers_to_collect = self.params.maximum_sequence_numbers_to_collect;
        }
        let upper_bound = self.nth_sequence_number(persistence, sequence_numbers_to_collect);
        let targets_removed = persistence.remove_targets(upper_bound, active_target_ids);
        let documents_removed = persistence.remove_orphaned_documents(upper_bound);
        log::debug!(
            "LRU garbage collection: counted {sequence_numbers_to_collect} sequence numbers, \
             removed {targets_removed} targets and {documents_removed} documents"
        );
        LruResults {
            did_run: true,
            sequence_numbers_collected: sequence_numbers_to_collect,
            targets_removed,
            documents_removed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::target_data::{TargetData, TargetPurpose};
    use crate::firestore::model::{DocumentKey, MutableDocument, ObjectValue, ResourcePath, SnapshotVersion, Timestamp};
    use crate::platform::token::User;

    fn populate(persistence: &mut MemoryPersistence, count: usize) {
        for index in 0..count {
            persistence.start_transaction("add");
            let key = DocumentKey::from_string(&format!("docs/d{index}")).unwrap();
            let version = SnapshotVersion::new(Timestamp::new(1, 0));
            let mut doc = MutableDocument::new_found_document(key.clone(), version, ObjectValue::empty());
            doc.set_read_time(version);
            persistence.add_document(doc);
            persistence.touch(&key);
        }
    }

    #[test]
    fn finds_nth_smallest_sequence_number() {
        let mut persistence = MemoryPersistence::new(&User::unauthenticated());
        populate(&mut persistence, 10);
        let collector = LruGarbageCollector::new(LruParams::with_cache_size(1));
        assert_eq!(collector.nth_sequence_number(&persistence, 0), INVALID_SEQUENCE_NUMBER);
        assert_eq!(collector.nth_sequence_number(&persistence, 3), 3);
        assert_eq!(collector.calculate_target_count(&persistence, 50), 5);
    }

    #[test]
    fn disabled_collector_never_runs() {
        let mut persistence = MemoryPersistence::new(&User::unauthenticated());
        populate(&mut persistence, 10);
        let results = LruGarbageCollector::new(LruParams::disabled()).collect(&mut persistence, &HashSet::new());
        assert!(!results.did_run);
        assert_eq!(persistence.remote_documents().len(), 10);
    }

    #[test]
    fn removes_oldest_documents_and_inactive_targets() {
        let mut persistence = MemoryPersistence::new(&User::unauthenticated());
        let sequence_number = persistence.start_transaction("target");
        let target_id = persistence.target_cache_mut().allocate_target_id();
        let target = Query::new(ResourcePath::from_string("docs").unwrap()).to_target();
        persistence
            .target_cache_mut()
            .add_target_data(TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number));
        populate(&mut persistence, 19);

        let mut params = LruParams::with_cache_size(1);
        params.percentile_to_collect = 50;
        let results = LruGarbageCollector::new(params).collect(&mut persistence, &HashSet::new());
        assert!(results.did_run);
        assert_eq!(results.sequence_numbers_collected, 10);
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 9);
        assert_eq!(persistence.remote_documents().len(), 10);
    }
}
