use std::collections::{HashMap, HashSet};

use crate::firestore::core::target::TargetId;
use crate::firestore::core::types::{ListenSequence, ListenSequenceNumber, INVALID_SEQUENCE_NUMBER};
use crate::firestore::local::document_overlay_cache::MemoryDocumentOverlayCache;
use crate::firestore::local::index_manager::MemoryIndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::mutation_queue::MemoryMutationQueue;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::MemoryRemoteDocumentCache;
use crate::firestore::local::target_cache::MemoryTargetCache;
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::{DocumentKey, DocumentKeySet, MutableDocument};
use crate::platform::token::User;
use crate::util::assert::fail;

/// In-memory storage for everything the local store keeps: cached
/// documents, targets, and per-user mutation queues and overlays.
///
/// Every document reference change is stamped with the sequence number of
/// the current transaction so least-recently-used documents can be evicted.
#[derive(Debug)]
pub struct MemoryPersistence {
    remote_documents: MemoryRemoteDocumentCache,
    target_cache: MemoryTargetCache,
    index_manager: MemoryIndexManager,
    mutation_queues: HashMap<String, MemoryMutationQueue>,
    overlay_caches: HashMap<String, MemoryDocumentOverlayCache>,
    user_key: String,
    /// Documents pinned by views that are currently displayed.
    local_view_references: ReferenceSet,
    orphaned_sequence_numbers: HashMap<DocumentKey, ListenSequenceNumber>,
    listen_sequence: ListenSequence,
    current_sequence_number: ListenSequenceNumber,
}

impl MemoryPersistence {
    pub fn new(user: &User) -> Self {
        let mut persistence = Self {
            remote_documents: MemoryRemoteDocumentCache::new(),
            target_cache: MemoryTargetCache::new(),
            index_manager: MemoryIndexManager::new(),
            mutation_queues: HashMap::new(),
            overlay_caches: HashMap::new(),
            user_key: String::new(),
            local_view_references: ReferenceSet::new(),
            orphaned_sequence_numbers: HashMap::new(),
            listen_sequence: ListenSequence::new(0),
            current_sequence_number: INVALID_SEQUENCE_NUMBER,
        };
        persistence.set_user(user);
        persistence
    }

    /// Switches the mutation queue and overlays to those of `user`.
    pub fn set_user(&mut self, user: &User) {
        self.user_key = user.to_key();
        self.mutation_queues.entry(self.user_key.clone()).or_default();
        self.overlay_caches.entry(self.user_key.clone()).or_default();
    }

    /// Begins a unit of work and returns its sequence number.
    pub fn start_transaction(&mut self, action: &str) -> ListenSequenceNumber {
        self.current_sequence_number = self.listen_sequence.next();
        log::trace!("starting transaction {action} at sequence number {}", self.current_sequence_number);
        self.current_sequence_number
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }

    pub fn remote_documents(&self) -> &MemoryRemoteDocumentCache {
        &self.remote_documents
    }

    pub fn target_cache(&self) -> &MemoryTargetCache {
        &self.target_cache
    }

    pub fn target_cache_mut(&mut self) -> &mut MemoryTargetCache {
        &mut self.target_cache
    }

    pub fn index_manager(&self) -> &MemoryIndexManager {
        &self.index_manager
    }

    pub fn mutation_queue(&self) -> &MemoryMutationQueue {
        match self.mutation_queues.get(&self.user_key) {
            Some(queue) => queue,
            None => fail(0x2f1d, "no mutation queue for the current user"),
        }
    }

    pub fn mutation_queue_mut(&mut self) -> &mut MemoryMutationQueue {
        self.mutation_queues.entry(self.user_key.clone()).or_default()
    }

    pub fn overlay_cache(&self) -> &MemoryDocumentOverlayCache {
        match self.overlay_caches.get(&self.user_key) {
            Some(cache) => cache,
            None => fail(0x2f1e, "no overlay cache for the current user"),
        }
    }

    pub fn overlay_cache_mut(&mut self) -> &mut MemoryDocumentOverlayCache {
        self.overlay_caches.entry(self.user_key.clone()).or_default()
    }

    pub fn local_documents_view(&mut self) -> LocalDocumentsView<'_> {
        let mutation_queue = self.mutation_queues.entry(self.user_key.clone()).or_default();
        let overlays = self.overlay_caches.entry(self.user_key.clone()).or_default();
        LocalDocumentsView::new(&self.remote_documents, mutation_queue, overlays, &self.index_manager)
    }

    pub fn local_view_references_mut(&mut self) -> &mut ReferenceSet {
        &mut self.local_view_references
    }

    /// Stores a document and indexes its collection for group queries.
    pub fn add_document(&mut self, document: MutableDocument) {
        let collection = document.key().collection_path();
        self.index_manager.add_to_collection_parent_index(&collection);
        self.remote_documents.add_entry(document);
    }

    pub fn remove_document(&mut self, key: &DocumentKey) {
        self.remote_documents.remove_entry(key);
    }

    /// Indexes the collections written by a new mutation batch.
    pub fn index_mutated_collection(&mut self, key: &DocumentKey) {
        self.index_manager.add_to_collection_parent_index(&key.collection_path());
    }

    pub fn add_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.target_cache.add_matching_keys(keys.iter(), target_id);
        for key in keys.iter() {
            self.touch(key);
        }
    }

    pub fn remove_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        self.target_cache.remove_matching_keys(keys.iter(), target_id);
        for key in keys.iter() {
            self.touch(key);
        }
    }

    /// Records that a reference to `key` was dropped or changed in the
    /// current transaction.
    pub fn touch(&mut self, key: &DocumentKey) {
        self.orphaned_sequence_numbers
            .insert(key.clone(), self.current_sequence_number);
    }

    /// Marks a released target as used now so it ages from this point.
    pub fn remove_target(&mut self, target_data: &TargetData) {
        let updated = target_data.with_sequence_number(self.current_sequence_number);
        self.target_cache.update_target_data(updated);
    }

    pub fn mutation_queues_contain_key(&self, key: &DocumentKey) -> bool {
        self.mutation_queues.values().any(|queue| queue.contains_key(key))
    }

    /// Number of sequence numbers the garbage collector can choose from.
    pub fn sequence_number_count(&self) -> usize {
        self.target_cache.target_count() + self.orphaned_sequence_numbers.len()
    }

    /// Every target and document sequence number.
    pub fn sequence_numbers(&self) -> impl Iterator<Item = ListenSequenceNumber> + '_ {
        self.target_cache
            .targets()
            .map(|target| target.sequence_number)
            .chain(self.orphaned_sequence_numbers.values().copied())
    }

    pub fn remove_targets(
        &mut self,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &HashSet<TargetId>,
    ) -> usize {
        self.target_cache.remove_targets(upper_bound, active_target_ids).len()
    }

    /// Evicts cached documents no longer referenced by any target, mutation
    /// or view and last touched at or below `upper_bound`.
    pub fn remove_orphaned_documents(&mut self, upper_bound: ListenSequenceNumber) -> usize {
        let doomed: Vec<DocumentKey> = self
            .remote_documents
            .keys()
            .filter(|key| !self.is_pinned(key, upper_bound))
            .cloned()
            .collect();
        for key in &doomed {
            self.remote_documents.remove_entry(key);
            self.orphaned_sequence_numbers.remove(key);
        }
        doomed.len()
    }

    /// Approximate byte size of the document cache.
    pub fn byte_size(&self) -> usize {
        self.remote_documents.size()
    }

    fn is_pinned(&self, key: &DocumentKey, upper_bound: ListenSequenceNumber) -> bool {
        if self.mutation_queues_contain_key(key)
            || self.target_cache.contains_key(key)
            || self.local_view_references.contains_key(key)
        {
            return true;
        }
        self.orphaned_sequence_numbers
            .get(key)
            .is_some_and(|sequence_number| *sequence_number > upper_bound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{Mutation, ObjectValue, SnapshotVersion, Timestamp};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn cached(path: &str) -> MutableDocument {
        let version = SnapshotVersion::new(Timestamp::new(1, 0));
        let mut doc = MutableDocument::new_found_document(key(path), version, ObjectValue::empty());
        doc.set_read_time(version);
        doc
    }

    #[test]
    fn mutation_queues_are_per_user() {
        let mut persistence = MemoryPersistence::new(&User::new("alice"));
        persistence
            .mutation_queue_mut()
            .add_mutation_batch(Timestamp::now(), Vec::new(), vec![Mutation::delete(key("c/a"))]);
        persistence.set_user(&User::new("bob"));
        assert!(persistence.mutation_queue().check_empty());
        assert!(persistence.mutation_queues_contain_key(&key("c/a")));
        persistence.set_user(&User::new("alice"));
        assert!(!persistence.mutation_queue().check_empty());
    }

    #[test]
    fn orphaned_documents_are_evicted_unless_pinned() {
        let mut persistence = MemoryPersistence::new(&User::unauthenticated());
        persistence.start_transaction("populate");
        persistence.add_document(cached("c/a"));
        persistence.add_document(cached("c/b"));
        persistence.add_document(cached("c/c"));
        persistence.touch(&key("c/a"));
        persistence.touch(&key("c/b"));
        persistence.local_view_references_mut().add_reference(key("c/b"), 2);

        let later = persistence.start_transaction("touch");
        persistence.touch(&key("c/c"));

        let removed = persistence.remove_orphaned_documents(later - 1);
        assert_eq!(removed, 1);
        assert!(!persistence.remote_documents().get_entry(&key("c/a")).is_valid_document());
        assert!(persistence.remote_documents().get_entry(&key("c/b")).is_valid_document());
        assert!(persistence.remote_documents().get_entry(&key("c/c")).is_valid_document());
    }
}
