use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_lock::Mutex;

use crate::firestore::core::query::Query;
use crate::firestore::core::target::{Target, TargetId};
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::local::local_documents_view::{to_mutable_map, MutableDocumentMap};
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
use crate::firestore::local::persistence::MemoryPersistence;
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::target_data::{TargetData, TargetPurpose};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, Mutation, MutationBatch, MutationBatchResult,
    Precondition, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::{RemoteEvent, TargetChange};
use crate::platform::token::User;
use crate::util::assert::hard_assert;

/// Resume tokens older than this are written even when nothing else about
/// the target changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug)]
pub struct LocalWriteResult {
    pub batch_id: i32,
    pub changes: DocumentMap,
}

/// Queued batches dropped before they were ever sent.
#[derive(Clone, Debug)]
pub struct RemovedWrites {
    pub batch_ids: Vec<i32>,
    /// For each removed batch, the newest batch still queued before it.
    pub preceding_batch_ids: BTreeMap<i32, i32>,
    pub changes: DocumentMap,
}

#[derive(Clone, Debug)]
pub struct QueryResult {
    pub documents: DocumentMap,
    pub remote_keys: DocumentKeySet,
}

/// Mutation batches that appeared or disappeared on a user switch, and the
/// local view of every document they touch.
#[derive(Clone, Debug)]
pub struct UserChangeResult {
    pub affected_documents: DocumentMap,
    pub removed_batch_ids: Vec<i32>,
    pub added_batch_ids: Vec<i32>,
}

/// Documents a view started or stopped displaying, used to pin them in the
/// cache while they are visible.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

impl LocalViewChanges {
    pub fn from_snapshot(target_id: TargetId, snapshot: &ViewSnapshot) -> Self {
        let mut added_keys = DocumentKeySet::new();
        let mut removed_keys = DocumentKeySet::new();
        for change in &snapshot.doc_changes {
            match change.change_type {
                ChangeType::Added => added_keys = added_keys.insert(change.doc.key().clone()),
                ChangeType::Removed => removed_keys = removed_keys.insert(change.doc.key().clone()),
                ChangeType::Modified | ChangeType::Metadata => {}
            }
        }
        Self {
            target_id,
            from_cache: snapshot.from_cache,
            added_keys,
            removed_keys,
        }
    }
}

struct LocalStoreState {
    persistence: MemoryPersistence,
    /// Targets currently in use, with their most recent in-memory state.
    target_data_by_target: HashMap<TargetId, TargetData>,
    target_id_by_canonical_id: HashMap<String, TargetId>,
}

impl LocalStoreState {
    fn target_data_for(&self, target: &Target) -> Option<TargetData> {
        if let Some(target_id) = self.target_id_by_canonical_id.get(&target.canonical_id()) {
            return self.target_data_by_target.get(target_id).cloned();
        }
        self.persistence.target_cache().get_target_data(target).cloned()
    }
}

/// The local half of the client: owns cached documents, queued writes and
/// target metadata, and computes the local view of documents after every
/// change.
///
/// Each operation runs as a single transaction. Operations never interleave.
pub struct LocalStore {
    state: Mutex<LocalStoreState>,
    query_engine: QueryEngine,
    garbage_collector: LruGarbageCollector,
}

impl LocalStore {
    pub fn new(user: &User, lru_params: LruParams) -> Self {
        Self {
            state: Mutex::new(LocalStoreState {
                persistence: MemoryPersistence::new(user),
                target_data_by_target: HashMap::new(),
                target_id_by_canonical_id: HashMap::new(),
            }),
            query_engine: QueryEngine::new(),
            garbage_collector: LruGarbageCollector::new(lru_params),
        }
    }

    /// Switches to the mutation queue of `user`. The returned documents are
    /// those whose local view may have changed.
    pub async fn handle_user_change(&self, user: &User) -> UserChangeResult {
        let mut state = self.state.lock().await;
        let persistence = &mut state.persistence;
        persistence.start_transaction("handle user change");
        let old_batches = persistence.mutation_queue().get_all_mutation_batches().to_vec();
        persistence.set_user(user);
        let new_batches = persistence.mutation_queue().get_all_mutation_batches().to_vec();

        let old_ids: BTreeSet<i32> = old_batches.iter().map(|batch| batch.batch_id).collect();
        let new_ids: BTreeSet<i32> = new_batches.iter().map(|batch| batch.batch_id).collect();
        let mut changed_keys = DocumentKeySet::new();
        for batch in old_batches.iter().chain(&new_batches) {
            for mutation in &batch.mutations {
                changed_keys = changed_keys.insert(mutation.key().clone());
            }
        }

        let affected_documents = persistence.local_documents_view().get_documents(changed_keys.iter());
        UserChangeResult {
            affected_documents,
            removed_batch_ids: old_ids.difference(&new_ids).copied().collect(),
            added_batch_ids: new_ids.difference(&old_ids).copied().collect(),
        }
    }

    /// Queues `mutations` as a new batch and returns the resulting local
    /// view of the documents they touch.
    pub async fn write_locally(&self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        if mutations.is_empty() {
            return Err(invalid_argument("cannot write an empty batch"));
        }
        let local_write_time = Timestamp::now();
        let keys: DocumentKeySet = mutations.iter().map(|mutation| mutation.key().clone()).collect();

        let mut state = self.state.lock().await;
        let persistence = &mut state.persistence;
        persistence.start_transaction("locally write mutations");

        let remote_documents = persistence.remote_documents().get_entries(keys.iter());
        let documents_without_remote_version: BTreeSet<DocumentKey> = remote_documents
            .iter()
            .filter(|(_, document)| !document.is_valid_document())
            .map(|(key, _)| key.clone())
            .collect();

        let mut overlayed = persistence
            .local_documents_view()
            .get_overlayed_documents(to_mutable_map(&remote_documents));

        // Transforms need the value they were applied to so that replaying
        // the batch later yields the same result.
        let mut base_mutations = Vec::new();
        for mutation in &mutations {
            let Some(overlayed_document) = overlayed.get(mutation.key()) else {
                continue;
            };
            if let Some(base_value) = mutation.extract_base_value(&overlayed_document.document) {
                let mask = base_value.field_mask();
                base_mutations.push(Mutation::patch(
                    mutation.key().clone(),
                    base_value,
                    mask,
                    Precondition::Exists(true),
                ));
            }
        }

        let batch = persistence
            .mutation_queue_mut()
            .add_mutation_batch(local_write_time, base_mutations, mutations);
        let overlays = batch.apply_to_local_document_set(&mut overlayed, &documents_without_remote_version);
        persistence.overlay_cache_mut().save_overlays(batch.batch_id, overlays);
        for key in keys.iter() {
            persistence.index_mutated_collection(key);
        }

        let changes = overlayed
            .into_iter()
            .map(|(key, overlayed_document)| (key, overlayed_document.document))
            .collect();
        Ok(LocalWriteResult {
            batch_id: batch.batch_id,
            changes,
        })
    }

    /// Drops the queued writes behind an unconditional delete of documents
    /// the backend has never seen, so neither the creation nor the delete is
    /// sent.
    ///
    /// Applies only when every deleted key was first written by a set, no
    /// cached remote version exists for it, and each batch touching it
    /// writes nothing else and is not in `in_flight`. Returns `None` and
    /// leaves the queue untouched otherwise.
    pub async fn remove_unsynced_writes(
        &self,
        mutations: &[Mutation],
        in_flight: &BTreeSet<i32>,
    ) -> Option<RemovedWrites> {
        let plain_deletes = mutations
            .iter()
            .all(|mutation| mutation.is_delete() && mutation.precondition().is_none());
        if mutations.is_empty() || !plain_deletes {
            return None;
        }
        let keys: DocumentKeySet = mutations.iter().map(|mutation| mutation.key().clone()).collect();

        let mut state = self.state.lock().await;
        let persistence = &mut state.persistence;
        let batches = persistence
            .mutation_queue()
            .get_all_mutation_batches_affecting_document_keys(keys.iter());
        for key in keys.iter() {
            if persistence.remote_documents().get_entry(key).is_valid_document() {
                return None;
            }
            let first_write = batches
                .iter()
                .flat_map(|batch| &batch.mutations)
                .find(|mutation| mutation.key() == key);
            if !first_write.is_some_and(Mutation::is_set) {
                return None;
            }
        }
        let self_contained = batches.iter().all(|batch| {
            !in_flight.contains(&batch.batch_id)
                && batch
                    .mutations
                    .iter()
                    .chain(&batch.base_mutations)
                    .all(|mutation| keys.contains(mutation.key()))
        });
        if !self_contained {
            return None;
        }

        persistence.start_transaction("remove unsynced writes");
        for batch in &batches {
            for key in persistence.mutation_queue_mut().remove_unsent_mutation_batch(batch) {
                persistence.touch(&key);
            }
            persistence.overlay_cache_mut().remove_overlays_for_batch_id(batch.batch_id);
        }
        let batch_ids: Vec<i32> = batches.iter().map(|batch| batch.batch_id).collect();
        let remaining = persistence.mutation_queue().get_all_mutation_batches();
        let preceding_batch_ids = batch_ids
            .iter()
            .filter_map(|&removed| {
                remaining
                    .iter()
                    .rev()
                    .find(|batch| batch.batch_id < removed)
                    .map(|batch| (removed, batch.batch_id))
            })
            .collect();

        let mut view = persistence.local_documents_view();
        view.recalculate_and_save_overlays_for_document_keys(keys.iter());
        log::debug!("dropped {} queued batches for documents never synced", batch_ids.len());
        Some(RemovedWrites {
            batch_ids,
            preceding_batch_ids,
            changes: view.get_documents(keys.iter()),
        })
    }

    /// Applies an acknowledged batch to the remote document cache and drops
    /// it from the queue.
    pub async fn acknowledge_batch(&self, batch_result: MutationBatchResult) -> FirestoreResult<DocumentMap> {
        let mut state = self.state.lock().await;
        let persistence = &mut state.persistence;
        persistence.start_transaction("acknowledge batch");

        let batch = batch_result.batch.clone();
        let affected_keys = batch.keys();
        if let Some(key) = affected_keys
            .iter()
            .find(|key| !batch_result.doc_versions.contains_key(*key))
        {
            return Err(FirestoreError::local_storage(format!(
                "acknowledged batch {} has no version for {key}",
                batch.batch_id
            )));
        }
        persistence
            .mutation_queue_mut()
            .acknowledge_batch(&batch, batch_result.stream_token.clone());

        for key in affected_keys.iter() {
            let mut document = persistence.remote_documents().get_entry(key);
            let Some(ack_version) = batch_result.doc_versions.get(key).copied() else {
                continue;
            };
            if document.version() < ack_version {
                batch.apply_to_remote_document(&mut document, &batch_result);
                if document.is_valid_document() {
                    document.set_read_time(batch_result.commit_version);
                    persistence.add_document(document);
                }
            }
        }

        for key in persistence.mutation_queue_mut().remove_mutation_batch(&batch) {
            persistence.touch(&key);
        }
        persistence.overlay_cache_mut().remove_overlays_for_batch_id(batch.batch_id);

        let keys_with_transform_results: DocumentKeySet = batch
            .mutations
            .iter()
            .zip(&batch_result.mutation_results)
            .filter(|(_, result)| !result.transform_results.is_empty())
            .map(|(mutation, _)| mutation.key().clone())
            .collect();
        let mut view = persistence.local_documents_view();
        view.recalculate_and_save_overlays_for_document_keys(keys_with_transform_results.iter());
        log::debug!("acknowledged batch {}", batch.batch_id);
        Ok(view.get_documents(affected_keys.iter()))
    }

    /// Drops a batch the backend refused and restores the documents it
    /// touched.
    pub async fn reject_batch(&self, batch_id: i32) -> FirestoreResult<DocumentMap> {
        let mut state = self.state.lock().await;
        let persistence = &mut state.persistence;
        persistence.start_transaction("reject batch");

        let Some(batch) = persistence.mutation_queue().lookup_mutation_batch(batch_id).cloned() else {
            return Err(FirestoreError::local_storage(format!(
                "attempt to reject nonexistent batch {batch_id}"
            )));
        };
        let affected_keys = batch.keys();
        for key in persistence.mutation_queue_mut().remove_mutation_batch(&batch) {
            persistence.touch(&key);
        }
        persistence.overlay_cache_mut().remove_overlays_for_batch_id(batch_id);

        let mut view = persistence.local_documents_view();
        view.recalculate_and_save_overlays_for_document_keys(affected_keys.iter());
        log::debug!("rejected batch {batch_id}");
        Ok(view.get_documents(affected_keys.iter()))
    }

    pub async fn get_highest_unacknowledged_batch_id(&self) -> i32 {
        let state = self.state.lock().await;
        state.persistence.mutation_queue().get_highest_unacknowledged_batch_id()
    }

    pub async fn get_last_stream_token(&self) -> Vec<u8> {
        let state = self.state.lock().await;
        state.persistence.mutation_queue().last_stream_token().to_vec()
    }

    pub async fn set_last_stream_token(&self, stream_token: Vec<u8>) {
        let mut state = self.state.lock().await;
        state.persistence.mutation_queue_mut().set_last_stream_token(stream_token);
    }

    pub async fn get_last_remote_snapshot_version(&self) -> SnapshotVersion {
        let state = self.state.lock().await;
        state.persistence.target_cache().get_last_remote_snapshot_version()
    }

    /// Oldest queued batch after `after_batch_id`, or the very first one for
    /// `None`.
    pub async fn next_mutation_batch(&self, after_batch_id: Option<i32>) -> Option<MutationBatch> {
        let state = self.state.lock().await;
        state
            .persistence
            .mutation_queue()
            .get_next_mutation_batch_after_batch_id(after_batch_id.unwrap_or(BATCH_ID_UNKNOWN))
            .cloned()
    }

    /// Applies a consistent snapshot of watch changes to the cache and
    /// returns the local view of every changed document.
    pub async fn apply_remote_event(&self, remote_event: RemoteEvent) -> FirestoreResult<DocumentMap> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let remote_version = remote_event.snapshot_version;
        let last_remote_version = state.persistence.target_cache().get_last_remote_snapshot_version();
        if remote_version != SnapshotVersion::min() && remote_version < last_remote_version {
            return Err(FirestoreError::local_storage(format!(
                "watch stream reverted to previous snapshot: {remote_version} < {last_remote_version}"
            )));
        }
        let sequence_number = state.persistence.start_transaction("apply remote event");

        for (target_id, change) in &remote_event.target_changes {
            let Some(old_target_data) = state.target_data_by_target.get(target_id).cloned() else {
                continue;
            };
            state.persistence.remove_matching_keys(&change.removed_documents, *target_id);
            state.persistence.add_matching_keys(&change.added_documents, *target_id);

            let mut new_target_data = old_target_data.with_sequence_number(sequence_number);
            if remote_event.target_mismatches.contains_key(target_id) {
                new_target_data = new_target_data
                    .with_resume_token(Vec::new(), SnapshotVersion::min())
                    .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
            } else if !change.resume_token.is_empty() {
                new_target_data = new_target_data.with_resume_token(change.resume_token.clone(), remote_version);
            }

            if should_persist_target_data(&old_target_data, &new_target_data, change) {
                state.persistence.target_cache_mut().update_target_data(new_target_data.clone());
            }
            state.target_data_by_target.insert(*target_id, new_target_data);
        }

        for key in remote_event.resolved_limbo_documents.iter() {
            if remote_event.document_updates.contains_key(key) {
                state.persistence.touch(key);
            }
        }

        let (changed_documents, existence_changed_keys) =
            populate_document_changes(&mut state.persistence, &remote_event.document_updates)?;

        if remote_version != SnapshotVersion::min() {
            state
                .persistence
                .target_cache_mut()
                .set_targets_metadata(sequence_number, Some(remote_version));
        }

        Ok(state
            .persistence
            .local_documents_view()
            .get_local_view_of_documents(changed_documents, &existence_changed_keys))
    }

    /// Pins or unpins documents shown by views and records the snapshot
    /// version at which a target was last free of limbo documents.
    pub async fn notify_local_view_changes(&self, view_changes: Vec<LocalViewChanges>) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.persistence.start_transaction("notify local view changes");
        for view_change in view_changes {
            let target_id = view_change.target_id;
            state
                .persistence
                .local_view_references_mut()
                .add_references(view_change.added_keys.iter(), target_id);
            state
                .persistence
                .local_view_references_mut()
                .remove_references(view_change.removed_keys.iter(), target_id);
            for key in view_change.added_keys.iter().chain(view_change.removed_keys.iter()) {
                state.persistence.touch(key);
            }

            if !view_change.from_cache {
                let Some(target_data) = state.target_data_by_target.get(&target_id) else {
                    log::debug!("ignoring view changes for released target {target_id}");
                    continue;
                };
                // Everything up to the current snapshot version is known to
                // be free of limbo documents.
                let updated = target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
                state.target_data_by_target.insert(target_id, updated);
            }
        }
    }

    /// Returns the target's data, allocating and persisting a new target id
    /// when it has never been seen.
    pub async fn allocate_target(&self, target: Target) -> TargetData {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        let sequence_number = state.persistence.start_transaction("allocate target");

        let target_data = match state.persistence.target_cache().get_target_data(&target).cloned() {
            Some(cached) => cached,
            None => {
                let target_id = state.persistence.target_cache_mut().allocate_target_id();
                let target_data = TargetData::new(target, target_id, TargetPurpose::Listen, sequence_number);
                state.persistence.target_cache_mut().add_target_data(target_data.clone());
                target_data
            }
        };

        let target_id = target_data.target_id;
        if !state.target_data_by_target.contains_key(&target_id) {
            state.target_data_by_target.insert(target_id, target_data.clone());
            state
                .target_id_by_canonical_id
                .insert(target_data.target.canonical_id(), target_id);
        }
        target_data
    }

    pub async fn get_target_data(&self, target: &Target) -> Option<TargetData> {
        let state = self.state.lock().await;
        state.target_data_for(target)
    }

    /// Stops tracking an active target. Its cached data stays available for
    /// later listens until garbage collected.
    pub async fn release_target(&self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.persistence.start_transaction("release target");

        let Some(target_data) = state.target_data_by_target.remove(&target_id) else {
            return Err(FirestoreError::local_storage(format!(
                "tried to release nonexistent target {target_id}"
            )));
        };
        state
            .target_id_by_canonical_id
            .remove(&target_data.target.canonical_id());

        for key in state
            .persistence
            .local_view_references_mut()
            .remove_references_for_id(target_id)
        {
            state.persistence.touch(&key);
        }
        if !keep_persisted_target_data {
            state.persistence.remove_target(&target_data);
        }
        Ok(())
    }

    /// Runs a query against the cache. With `use_previous_results`, the
    /// documents the target matched when it was last limbo-free are reused.
    pub async fn execute_query(&self, query: &Query, use_previous_results: bool) -> QueryResult {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.persistence.start_transaction("execute query");

        let mut last_limbo_free_snapshot_version = SnapshotVersion::min();
        let mut remote_keys = DocumentKeySet::new();
        if let Some(target_data) = state.target_data_for(&query.to_target()) {
            last_limbo_free_snapshot_version = target_data.last_limbo_free_snapshot_version;
            remote_keys = state
                .persistence
                .target_cache()
                .get_matching_keys_for_target_id(target_data.target_id);
        }

        let (since, keys) = if use_previous_results {
            (last_limbo_free_snapshot_version, remote_keys.clone())
        } else {
            (SnapshotVersion::min(), DocumentKeySet::new())
        };
        let mut view = state.persistence.local_documents_view();
        let documents = self
            .query_engine
            .get_documents_matching_query(&mut view, query, since, &keys);
        QueryResult {
            documents,
            remote_keys,
        }
    }

    /// Local view of a single document. Unknown documents come back invalid.
    pub async fn read_document(&self, key: &DocumentKey) -> MutableDocument {
        let mut state = self.state.lock().await;
        state.persistence.local_documents_view().get_document(key)
    }

    pub async fn get_remote_document_keys(&self, target_id: TargetId) -> DocumentKeySet {
        let state = self.state.lock().await;
        state
            .persistence
            .target_cache()
            .get_matching_keys_for_target_id(target_id)
    }

    pub fn lru_params(&self) -> LruParams {
        self.garbage_collector.params()
    }

    /// Evicts least recently used data when the cache is over its size
    /// budget. Active targets are kept.
    pub async fn collect_garbage(&self) -> LruResults {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        state.persistence.start_transaction("collect garbage");
        let active_target_ids: HashSet<TargetId> = state.target_data_by_target.keys().copied().collect();
        self.garbage_collector
            .collect(&mut state.persistence, &active_target_ids)
    }
}

/// Target data is written when it gains its first resume token, when the
/// stored token is older than the max age, or when documents changed.
fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let time_delta = new.snapshot_version.to_micros() - old.snapshot_version.to_micros();
    if time_delta >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    let changes = change.added_documents.len() + change.modified_documents.len() + change.removed_documents.len();
    changes > 0
}

/// Writes newer remote documents into the cache. Returns the documents
/// that changed and the keys whose existence flipped.
fn populate_document_changes(
    persistence: &mut MemoryPersistence,
    document_updates: &DocumentMap,
) -> FirestoreResult<(MutableDocumentMap, DocumentKeySet)> {
    let existing_documents = persistence.remote_documents().get_entries(document_updates.keys());
    let mut changed_documents = BTreeMap::new();
    let mut existence_changed_keys = DocumentKeySet::new();

    for (key, document) in document_updates.iter() {
        let existing = existing_documents
            .get(key)
            .cloned()
            .unwrap_or_else(|| MutableDocument::new_invalid_document(key.clone()));

        if document.is_found_document() != existing.is_found_document() {
            existence_changed_keys = existence_changed_keys.insert(key.clone());
        }

        // A deletion at version zero comes from limbo resolution and carries
        // no information worth caching.
        if document.is_no_document() && document.version() == SnapshotVersion::min() {
            persistence.remove_document(key);
            changed_documents.insert(key.clone(), document.clone());
        } else if !existing.is_valid_document()
            || document.version() > existing.version()
            || (document.version() == existing.version() && existing.has_pending_writes())
        {
            hard_assert(
                document.read_time() != SnapshotVersion::min(),
                0xbd9d,
                "cannot add a document when the remote version is zero",
            );
            persistence.add_document(document.clone());
            changed_documents.insert(key.clone(), document.clone());
        } else {
            log::debug!(
                "ignoring outdated watch update for {key}: current version {}, watch version {}",
                existing.version(),
                document.version()
            );
        }
    }
    Ok((changed_documents, existence_changed_keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{
        DocumentVersionMap, FieldMask, FieldPath, MutationResult, ObjectValue, ResourcePath,
    };
    use crate::firestore::value::FirestoreValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn object(field: &str, value: i64) -> ObjectValue {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated(field).unwrap(), FirestoreValue::from_integer(value));
        data
    }

    fn remote_doc(path: &str, seconds: i64, value: i64) -> MutableDocument {
        let mut doc = MutableDocument::new_found_document(key(path), version(seconds), object("n", value));
        doc.set_read_time(version(seconds));
        doc
    }

    fn store() -> LocalStore {
        LocalStore::new(&User::unauthenticated(), LruParams::disabled())
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn event_with_docs(seconds: i64, target_id: TargetId, docs: Vec<MutableDocument>) -> RemoteEvent {
        let mut event = RemoteEvent::new(version(seconds));
        let mut change = TargetChange {
            resume_token: vec![seconds as u8],
            current: true,
            ..TargetChange::default()
        };
        for doc in docs {
            change.added_documents = change.added_documents.insert(doc.key().clone());
            event.document_updates = event.document_updates.insert(doc.key().clone(), doc);
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[tokio::test]
    async fn local_write_is_visible_until_rejected() {
        let store = store();
        let result = store
            .write_locally(vec![Mutation::set(key("rooms/a"), object("n", 1))])
            .await
            .unwrap();
        let doc = result.changes.get(&key("rooms/a")).unwrap();
        assert!(doc.has_local_mutations());
        assert_eq!(store.get_highest_unacknowledged_batch_id().await, result.batch_id);

        let read = store.read_document(&key("rooms/a")).await;
        assert!(read.is_found_document());

        let changes = store.reject_batch(result.batch_id).await.unwrap();
        assert!(!changes.get(&key("rooms/a")).unwrap().is_found_document());
        assert!(!store.read_document(&key("rooms/a")).await.is_valid_document());
        assert!(store.next_mutation_batch(None).await.is_none());
    }

    #[tokio::test]
    async fn rejecting_unknown_batch_is_a_storage_error() {
        let err = store().reject_batch(42).await.unwrap_err();
        assert!(err.is_local_storage_failure());
    }

    #[tokio::test]
    async fn acknowledged_write_lands_in_remote_cache() {
        let store = store();
        let result = store
            .write_locally(vec![Mutation::set(key("rooms/a"), object("n", 1))])
            .await
            .unwrap();
        let batch = store.next_mutation_batch(None).await.unwrap();
        assert_eq!(batch.batch_id, result.batch_id);

        let batch_result = MutationBatchResult::from(
            batch,
            version(5),
            vec![MutationResult::new(version(5), Vec::new())],
            vec![9],
        );
        let changes = store.acknowledge_batch(batch_result).await.unwrap();
        let doc = changes.get(&key("rooms/a")).unwrap();
        assert!(doc.has_committed_mutations());
        assert_eq!(doc.version(), version(5));
        assert_eq!(store.get_last_stream_token().await, vec![9]);
        assert_eq!(store.get_highest_unacknowledged_batch_id().await, BATCH_ID_UNKNOWN);
    }

    #[tokio::test]
    async fn remote_event_updates_cache_and_ignores_older_versions() {
        let store = store();
        let target_data = store.allocate_target(rooms().to_target()).await;
        let target_id = target_data.target_id;

        let changes = store
            .apply_remote_event(event_with_docs(2, target_id, vec![remote_doc("rooms/a", 2, 1)]))
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(store.get_last_remote_snapshot_version().await, version(2));
        assert!(store.get_remote_document_keys(target_id).await.contains(&key("rooms/a")));

        let stale = store
            .apply_remote_event(event_with_docs(3, target_id, vec![remote_doc("rooms/a", 1, 7)]))
            .await
            .unwrap();
        assert!(stale.is_empty());
        let read = store.read_document(&key("rooms/a")).await;
        assert_eq!(read.version(), version(2));

        let persisted = store.get_target_data(&rooms().to_target()).await.unwrap();
        assert_eq!(persisted.resume_token, vec![3]);
    }

    #[tokio::test]
    async fn reverting_remote_version_fails() {
        let store = store();
        let target_id = store.allocate_target(rooms().to_target()).await.target_id;
        store
            .apply_remote_event(event_with_docs(5, target_id, Vec::new()))
            .await
            .unwrap();
        let err = store
            .apply_remote_event(event_with_docs(4, target_id, vec![remote_doc("rooms/late", 4, 1)]))
            .await
            .unwrap_err();
        assert!(err.is_local_storage_failure());
        // The rejected event leaves no trace in the caches.
        assert!(!store.read_document(&key("rooms/late")).await.is_found_document());
        assert!(store.get_remote_document_keys(target_id).await.is_empty());
    }

    #[tokio::test]
    async fn acknowledging_without_versions_changes_nothing() {
        let store = store();
        let written = store
            .write_locally(vec![Mutation::set(key("rooms/a"), object("n", 1))])
            .await
            .unwrap();
        let batch = store.next_mutation_batch(None).await.unwrap();
        let mut result = MutationBatchResult::from(
            batch,
            version(3),
            vec![MutationResult::new(version(3), Vec::new())],
            Vec::new(),
        );
        result.doc_versions = DocumentVersionMap::new();
        assert!(store.acknowledge_batch(result).await.unwrap_err().is_local_storage_failure());
        assert_eq!(store.get_highest_unacknowledged_batch_id().await, written.batch_id);
        assert!(store.read_document(&key("rooms/a")).await.has_local_mutations());
    }

    #[tokio::test]
    async fn deleting_a_locally_created_document_drops_its_batches() {
        let store = store();
        let kept = store
            .write_locally(vec![Mutation::set(key("rooms/kept"), object("n", 1))])
            .await
            .unwrap();
        let created = store
            .write_locally(vec![Mutation::set(key("rooms/ghost"), object("n", 1))])
            .await
            .unwrap();
        let patched = store
            .write_locally(vec![Mutation::patch(
                key("rooms/ghost"),
                object("n", 2),
                FieldMask::new(vec![FieldPath::from_dot_separated("n").unwrap()]),
                Precondition::Exists(true),
            )])
            .await
            .unwrap();

        let deletes = [Mutation::delete(key("rooms/ghost"))];
        let removed = store.remove_unsynced_writes(&deletes, &BTreeSet::new()).await.unwrap();
        assert_eq!(removed.batch_ids, vec![created.batch_id, patched.batch_id]);
        assert_eq!(removed.preceding_batch_ids.get(&patched.batch_id), Some(&kept.batch_id));
        assert!(!removed.changes.get(&key("rooms/ghost")).unwrap().is_valid_document());

        let state = store.state.lock().await;
        assert!(state.persistence.overlay_cache().get_overlay(&key("rooms/ghost")).is_none());
        assert!(state.persistence.overlay_cache().get_overlay(&key("rooms/kept")).is_some());
        drop(state);
        assert_eq!(store.get_highest_unacknowledged_batch_id().await, kept.batch_id);
        assert!(store.next_mutation_batch(Some(kept.batch_id)).await.is_none());
    }

    #[tokio::test]
    async fn deletes_of_synced_or_sent_documents_are_kept() {
        let store = store();
        let target_id = store.allocate_target(rooms().to_target()).await.target_id;
        store
            .apply_remote_event(event_with_docs(2, target_id, vec![remote_doc("rooms/synced", 2, 1)]))
            .await
            .unwrap();
        store
            .write_locally(vec![Mutation::set(key("rooms/synced"), object("n", 2))])
            .await
            .unwrap();
        let synced = [Mutation::delete(key("rooms/synced"))];
        assert!(store.remove_unsynced_writes(&synced, &BTreeSet::new()).await.is_none());

        let sent = store
            .write_locally(vec![Mutation::set(key("rooms/sent"), object("n", 1))])
            .await
            .unwrap();
        let in_flight = BTreeSet::from([sent.batch_id]);
        let deletes = [Mutation::delete(key("rooms/sent"))];
        assert!(store.remove_unsynced_writes(&deletes, &in_flight).await.is_none());

        let guarded = [Mutation::Delete {
            key: key("rooms/sent"),
            precondition: Precondition::Exists(true),
        }];
        assert!(store.remove_unsynced_writes(&guarded, &BTreeSet::new()).await.is_none());
        assert!(store.read_document(&key("rooms/sent")).await.is_found_document());
    }

    #[tokio::test]
    async fn allocate_target_reuses_cached_ids() {
        let store = store();
        let first = store.allocate_target(rooms().to_target()).await;
        let again = store.allocate_target(rooms().to_target()).await;
        assert_eq!(first.target_id, again.target_id);

        store.release_target(first.target_id, false).await.unwrap();
        assert!(store.release_target(first.target_id, false).await.is_err());
        let reused = store.allocate_target(rooms().to_target()).await;
        assert_eq!(reused.target_id, first.target_id);
    }

    #[tokio::test]
    async fn execute_query_merges_remote_and_local_documents() {
        let store = store();
        let target_id = store.allocate_target(rooms().to_target()).await.target_id;
        store
            .apply_remote_event(event_with_docs(2, target_id, vec![remote_doc("rooms/a", 2, 1)]))
            .await
            .unwrap();
        store
            .write_locally(vec![Mutation::set(key("rooms/b"), object("n", 2))])
            .await
            .unwrap();

        let result = store.execute_query(&rooms(), true).await;
        let keys: Vec<String> = result.documents.keys().map(|key| key.to_string()).collect();
        assert_eq!(keys, vec!["rooms/a", "rooms/b"]);
        assert_eq!(result.remote_keys.len(), 1);
    }

    #[tokio::test]
    async fn limbo_free_version_advances_for_synced_views() {
        let store = store();
        let target_id = store.allocate_target(rooms().to_target()).await.target_id;
        store
            .apply_remote_event(event_with_docs(2, target_id, vec![remote_doc("rooms/a", 2, 1)]))
            .await
            .unwrap();
        store
            .notify_local_view_changes(vec![LocalViewChanges {
                target_id,
                from_cache: false,
                added_keys: [key("rooms/a")].into_iter().collect(),
                removed_keys: DocumentKeySet::new(),
            }])
            .await;
        let target_data = store.get_target_data(&rooms().to_target()).await.unwrap();
        assert_eq!(target_data.last_limbo_free_snapshot_version, version(2));
    }

    #[tokio::test]
    async fn user_change_swaps_mutation_queues() {
        let store = LocalStore::new(&User::new("alice"), LruParams::disabled());
        let written = store
            .write_locally(vec![Mutation::set(key("rooms/a"), object("n", 1))])
            .await
            .unwrap();
        let result = store.handle_user_change(&User::new("bob")).await;
        assert_eq!(result.removed_batch_ids, vec![written.batch_id]);
        assert!(result.added_batch_ids.is_empty());
        assert!(!result.affected_documents.get(&key("rooms/a")).unwrap().is_found_document());
    }

    #[test]
    fn persists_target_data_on_first_token_or_changes() {
        let target = rooms().to_target();
        let old = TargetData::new(target, 2, TargetPurpose::Listen, 1);
        let new = old.with_resume_token(vec![1], version(1));
        assert!(should_persist_target_data(&old, &new, &TargetChange::default()));

        let newer = new.with_resume_token(vec![2], version(2));
        assert!(!should_persist_target_data(&new, &newer, &TargetChange::default()));

        let much_later = new.with_resume_token(vec![3], version(1 + 5 * 60));
        assert!(should_persist_target_data(&new, &much_later, &TargetChange::default()));

        let change = TargetChange {
            added_documents: [key("rooms/a")].into_iter().collect(),
            ..TargetChange::default()
        };
        assert!(should_persist_target_data(&new, &newer, &change));
    }
}
