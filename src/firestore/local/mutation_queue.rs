use std::collections::BTreeSet;

use crate::firestore::core::query::Query;
use crate::firestore::local::reference_set::DocReference;
use crate::firestore::model::{DocumentKey, Mutation, MutationBatch, Timestamp, BATCH_ID_UNKNOWN};
use crate::util::assert::hard_assert;
use crate::util::SortedSet;

/// Pending mutation batches of one user, oldest first.
#[derive(Clone, Debug)]
pub struct MemoryMutationQueue {
    queue: Vec<MutationBatch>,
    next_batch_id: i32,
    last_stream_token: Vec<u8>,
    /// Index from document key to the ids of batches touching it.
    batches_by_document_key: SortedSet<DocReference>,
}

impl Default for MemoryMutationQueue {
    fn default() -> Self {
        Self {
            queue: Vec::new(),
            next_batch_id: 1,
            last_stream_token: Vec::new(),
            batches_by_document_key: SortedSet::new(),
        }
    }
}

impl MemoryMutationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Records that the oldest batch was acknowledged together with the
    /// write stream token that came with it.
    pub fn acknowledge_batch(&mut self, batch: &MutationBatch, stream_token: Vec<u8>) {
        let index = self.index_of_existing_batch_id(batch.batch_id, "acknowledged");
        hard_assert(index == 0, 0xb4ef, "can only acknowledge the first batch in the mutation queue");
        self.last_stream_token = stream_token;
    }

    pub fn last_stream_token(&self) -> &[u8] {
        &self.last_stream_token
    }

    pub fn set_last_stream_token(&mut self, stream_token: Vec<u8>) {
        self.last_stream_token = stream_token;
    }

    pub fn add_mutation_batch(
        &mut self,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> MutationBatch {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        if let Some(prior) = self.queue.last() {
            hard_assert(prior.batch_id < batch_id, 0x7f00, "mutation batch ids must be monotonically increasing");
        }
        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        for mutation in &batch.mutations {
            self.batches_by_document_key = self
                .batches_by_document_key
                .insert(DocReference::new(mutation.key().clone(), batch_id));
        }
        self.queue.push(batch.clone());
        batch
    }

    pub fn lookup_mutation_batch(&self, batch_id: i32) -> Option<&MutationBatch> {
        self.find_mutation_batch(batch_id)
    }

    /// The first batch with an id greater than `batch_id`.
    pub fn get_next_mutation_batch_after_batch_id(&self, batch_id: i32) -> Option<&MutationBatch> {
        let index = self.queue.partition_point(|batch| batch.batch_id <= batch_id);
        self.queue.get(index)
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> i32 {
        self.queue.last().map_or(BATCH_ID_UNKNOWN, |batch| batch.batch_id)
    }

    pub fn get_all_mutation_batches(&self) -> &[MutationBatch] {
        &self.queue
    }

    pub fn get_all_mutation_batches_affecting_document_key(&self, key: &DocumentKey) -> Vec<MutationBatch> {
        self.batch_ids_for_key(key)
            .into_iter()
            .filter_map(|batch_id| self.find_mutation_batch(batch_id).cloned())
            .collect()
    }

    /// Batches touching any of `keys`, ordered by batch id.
    pub fn get_all_mutation_batches_affecting_document_keys<'a, I>(&self, keys: I) -> Vec<MutationBatch>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        let batch_ids: BTreeSet<i32> = keys
            .into_iter()
            .flat_map(|key| self.batch_ids_for_key(key))
            .collect();
        self.find_mutation_batches(batch_ids)
    }

    /// Batches touching documents directly inside the query's collection.
    pub fn get_all_mutation_batches_affecting_query(&self, query: &Query) -> Vec<MutationBatch> {
        hard_assert(
            !query.is_collection_group_query(),
            0x2eb7,
            "collection group queries are resolved per parent collection",
        );
        let prefix = query.path();
        let immediate_child_length = prefix.len() + 1;
        let start_key = if query.is_document_query() {
            DocumentKey::from_path(prefix.clone())
        } else {
            DocumentKey::first_in_collection(prefix)
        };
        let Ok(start_key) = start_key else {
            return Vec::new();
        };
        let start = DocReference::new(start_key, 0);
        let batch_ids: BTreeSet<i32> = self
            .batches_by_document_key
            .iter_from(&start)
            .take_while(|reference| prefix.is_prefix_of(reference.key.path()))
            .filter(|reference| reference.key.path().len() == immediate_child_length)
            .map(|reference| reference.target_or_batch_id)
            .collect();
        self.find_mutation_batches(batch_ids)
    }

    /// Removes `batch`, which must be the oldest batch in the queue, and
    /// returns the keys it referenced.
    pub fn remove_mutation_batch(&mut self, batch: &MutationBatch) -> Vec<DocumentKey> {
        let index = self.index_of_existing_batch_id(batch.batch_id, "removed");
        hard_assert(index == 0, 0x6c6c, "can only remove the first entry of the mutation queue");
        self.queue.remove(0);
        self.remove_references(batch)
    }

    /// Removes a batch that was never sent, wherever it sits in the queue.
    pub fn remove_unsent_mutation_batch(&mut self, batch: &MutationBatch) -> Vec<DocumentKey> {
        let index = self.index_of_existing_batch_id(batch.batch_id, "removed");
        self.queue.remove(index);
        self.remove_references(batch)
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        let start = DocReference::new(key.clone(), i32::MIN);
        self.batches_by_document_key
            .iter_from(&start)
            .next()
            .is_some_and(|reference| &reference.key == key)
    }

    pub fn perform_consistency_check(&self) {
        if self.queue.is_empty() {
            hard_assert(
                self.batches_by_document_key.is_empty(),
                0xdd90,
                "document leak -- detected dangling mutation references when queue is empty",
            );
        }
    }

    fn remove_references(&mut self, batch: &MutationBatch) -> Vec<DocumentKey> {
        let mut keys = Vec::with_capacity(batch.mutations.len());
        for mutation in &batch.mutations {
            self.batches_by_document_key = self
                .batches_by_document_key
                .remove(&DocReference::new(mutation.key().clone(), batch.batch_id));
            keys.push(mutation.key().clone());
        }
        keys
    }

    fn batch_ids_for_key(&self, key: &DocumentKey) -> Vec<i32> {
        let start = DocReference::new(key.clone(), i32::MIN);
        self.batches_by_document_key
            .iter_from(&start)
            .take_while(|reference| &reference.key == key)
            .map(|reference| reference.target_or_batch_id)
            .collect()
    }

    fn find_mutation_batches(&self, batch_ids: BTreeSet<i32>) -> Vec<MutationBatch> {
        batch_ids
            .into_iter()
            .filter_map(|batch_id| self.find_mutation_batch(batch_id).cloned())
            .collect()
    }

    fn index_of_existing_batch_id(&self, batch_id: i32, action: &str) -> usize {
        let index = self.queue.partition_point(|batch| batch.batch_id < batch_id);
        hard_assert(
            self.queue.get(index).is_some_and(|batch| batch.batch_id == batch_id),
            0xd6db,
            format!("batches must exist to be {action}"),
        );
        index
    }

    fn find_mutation_batch(&self, batch_id: i32) -> Option<&MutationBatch> {
        let index = self.queue.partition_point(|batch| batch.batch_id < batch_id);
        self.queue.get(index).filter(|batch| batch.batch_id == batch_id)
    }
}
