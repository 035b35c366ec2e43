use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::firestore::core::target::TargetId;
use crate::firestore::local::{TargetData, TargetPurpose};
use crate::firestore::model::{DatabaseId, DocumentKey, DocumentKeySet, MutableDocument, SnapshotVersion};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};
use crate::util::assert::{fail, hard_assert};

/// Provides metadata about active targets so the aggregator can reason about
/// documents the client already has.
pub trait TargetMetadataProvider: Send + Sync {
    /// Keys the local store currently associates with the target.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Target data for an active target, `None` once it has been unlistened.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

/// Outcome of checking a mismatched existence filter against its bloom filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    Success,
    Skipped,
    FalsePositive,
}

/// Changes accumulated for one target between two remote events.
#[derive(Debug)]
struct TargetState {
    /// Outstanding listen/unlisten requests. Changes for a target with
    /// pending responses belong to an older incarnation and are ignored.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    /// Starts dirty so the first remote event after a listen carries the
    /// target even when nothing changed.
    has_pending_changes: bool,
}

impl Default for TargetState {
    fn default() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }
}

impl TargetState {
    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut added_documents = DocumentKeySet::new();
        let mut modified_documents = DocumentKeySet::new();
        let mut removed_documents = DocumentKeySet::new();
        for (key, change_type) in &self.document_changes {
            match change_type {
                ChangeType::Added => added_documents = added_documents.insert(key.clone()),
                ChangeType::Modified => modified_documents = modified_documents.insert(key.clone()),
                ChangeType::Removed => removed_documents = removed_documents.insert(key.clone()),
            }
        }
        TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            added_documents,
            modified_documents,
            removed_documents,
        }
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        hard_assert(
            self.pending_responses >= 0,
            0x0ca9,
            "Too many target responses received",
        );
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds a stream of watch changes into consistent [`RemoteEvent`]s.
pub struct WatchChangeAggregator {
    metadata: Arc<dyn TargetMetadataProvider>,
    database_id: DatabaseId,
    target_states: HashMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, MutableDocument>,
    /// Targets each pending document update was reported for.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(metadata: Arc<dyn TargetMetadataProvider>, database_id: DatabaseId) -> Self {
        Self {
            metadata,
            database_id,
            target_states: HashMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, change: DocumentWatchChange) {
        for target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(*target_id, document.clone());
                }
                other => self.remove_document_from_target(*target_id, &change.key, other.clone()),
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(*target_id, &change.key, change.new_doc.clone());
        }
    }

    pub fn handle_target_change(&mut self, change: &WatchTargetChange) {
        for target_id in self.target_ids_for_change(change) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(target_id) {
                        self.ensure_target_state(target_id).update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    // An added target resets any changes from a previous incarnation.
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    hard_assert(
                        change.cause.is_none(),
                        0x5bf2,
                        "Errored targets are handled before reaching the aggregator",
                    );
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(target_id) {
                        // Synthesizes removes for every known document; the
                        // backend re-adds the ones that still match.
                        self.reset_target(target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    /// Compares the backend's document count with the local one. A mismatch
    /// the bloom filter cannot explain resets the target.
    pub fn handle_existence_filter(&mut self, change: &ExistenceFilterChange) {
        let target_id = change.target_id;
        let expected_count = change.existence_filter.count;

        let Some(target_data) = self.target_data_for_active_target(target_id) else {
            return;
        };

        let target = &target_data.target;
        if target.is_document_target() {
            if expected_count == 0 {
                // The document is gone. Remove it with a NoDocument so the
                // cache does not keep serving it.
                let key = DocumentKey::from_path(target.path().clone())
                    .unwrap_or_else(|_| fail(0x4f8a, "Document target with a non-document path"));
                let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
                self.remove_document_from_target(target_id, &key, Some(deleted));
            } else {
                hard_assert(
                    expected_count == 1,
                    0x4e2d,
                    format!("Single document existence filter with count: {expected_count}"),
                );
            }
            return;
        }

        let current_count = self.current_document_count_for_target(target_id);
        if current_count == expected_count as usize {
            return;
        }

        let status = match self.parse_bloom_filter(change) {
            Some(bloom_filter) => self.apply_bloom_filter(&bloom_filter, change, current_count),
            None => BloomFilterApplication::Skipped,
        };
        log::debug!(
            "existence filter mismatch for target {target_id}: local {current_count}, remote {expected_count}, bloom filter {status:?}"
        );

        if status != BloomFilterApplication::Success {
            self.reset_target(target_id);
            let purpose = if status == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    /// Folds the accumulated state into a remote event and clears the
    /// accumulators. Per-target state (current flag, resume token) survives.
    pub fn create_remote_event(&mut self, snapshot_version: SnapshotVersion) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();

        let mut target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        target_ids.sort_unstable();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(target_id) else {
                continue;
            };

            let current = self.target_states.get(&target_id).is_some_and(|state| state.current);
            if current && target_data.target.is_document_target() {
                // A current document target with no document tells us it
                // does not exist. Synthesize the delete.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let updated_for_target = self
                        .pending_document_target_mapping
                        .get(&key)
                        .is_some_and(|targets| targets.contains(&target_id));
                    if !updated_for_target && !self.target_contains_document(target_id, &key)
                    {
                        let deleted = MutableDocument::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(target_id, &key, Some(deleted));
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        // Documents referenced only by limbo targets are tracked separately
        // since no query target holds on to them.
        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, targets) in &self.pending_document_target_mapping {
            let only_limbo_targets = targets.iter().all(|target_id| {
                self.target_data_for_active_target(*target_id)
                    .map_or(true, |data| data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo_targets {
                resolved_limbo_documents = resolved_limbo_documents.insert(key.clone());
            }
        }

        let document_updates = std::mem::take(&mut self.pending_document_updates)
            .into_iter()
            .map(|(key, mut document)| {
                document.set_read_time(snapshot_version);
                (key, document)
            })
            .collect();

        let event = RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        };
        self.pending_document_target_mapping.clear();
        event
    }

    /// Records that a watch or unwatch request was sent for the target.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    fn target_ids_for_change(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states.entry(target_id).or_default()
    }

    fn add_document_to_target(&mut self, target_id: TargetId, document: MutableDocument) {
        if !self.is_active_target(target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// Removes the key from the target. `updated_document` carries the new
    /// state when known (a `NoDocument` for deletes).
    fn remove_document_from_target(
        &mut self,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<MutableDocument>,
    ) {
        if !self.is_active_target(target_id) {
            return;
        }
        let contained = self.target_contains_document(target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Entered and left the target between two events.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    fn reset_target(&mut self, target_id: TargetId) {
        hard_assert(
            !self.target_states.get(&target_id).is_some_and(TargetState::is_pending),
            0xfac3,
            "Should only reset active targets",
        );
        self.target_states.insert(target_id, TargetState::default());
        let existing_keys = self.metadata.get_remote_keys_for_target(target_id);
        for key in existing_keys.iter() {
            self.remove_document_from_target(target_id, key, None);
        }
    }

    fn current_document_count_for_target(&mut self, target_id: TargetId) -> usize {
        let change = self.ensure_target_state(target_id).to_target_change();
        let existing = self.metadata.get_remote_keys_for_target(target_id).len();
        (existing + change.added_documents.len()).saturating_sub(change.removed_documents.len())
    }

    fn parse_bloom_filter(&self, change: &ExistenceFilterChange) -> Option<BloomFilter> {
        let proto = change.existence_filter.unchanged_names.as_ref()?;
        match BloomFilter::new(proto.bitmap.clone(), proto.padding, proto.hash_count) {
            Ok(filter) if filter.bit_count() == 0 => None,
            Ok(filter) => Some(filter),
            Err(err) => {
                log::warn!("Applying bloom filter failed: {err}");
                None
            }
        }
    }

    fn apply_bloom_filter(
        &mut self,
        bloom_filter: &BloomFilter,
        change: &ExistenceFilterChange,
        current_count: usize,
    ) -> BloomFilterApplication {
        let expected_count = change.existence_filter.count as usize;
        let removed = self.filter_removed_documents(bloom_filter, change.target_id);
        if expected_count + removed == current_count {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Removes every cached key the bloom filter rules out and returns how
    /// many were removed.
    fn filter_removed_documents(&mut self, bloom_filter: &BloomFilter, target_id: TargetId) -> usize {
        let existing_keys = self.metadata.get_remote_keys_for_target(target_id);
        let documents_root = self.database_id.documents_root();
        let mut removed = 0;
        for key in existing_keys.iter() {
            let name = format!("{documents_root}/{}", key.path().canonical_string());
            if !bloom_filter.might_contain(&name) {
                self.remove_document_from_target(target_id, key, None);
                removed += 1;
            }
        }
        removed
    }

    fn target_contains_document(&self, target_id: TargetId, key: &DocumentKey) -> bool {
        self.metadata.get_remote_keys_for_target(target_id).contains(key)
    }

    fn is_active_target(&self, target_id: TargetId) -> bool {
        let active = self.target_data_for_active_target(target_id).is_some();
        if !active {
            log::debug!("detected inactive target {target_id}");
        }
        active
    }

    fn target_data_for_active_target(&self, target_id: TargetId) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => self.metadata.get_target_data_for_target(target_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::model::{ObjectValue, ResourcePath, Timestamp};
    use crate::firestore::remote::watch_change::{BloomFilterProto, ExistenceFilter};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestMetadata {
        targets: Mutex<HashMap<TargetId, TargetData>>,
        remote_keys: Mutex<HashMap<TargetId, DocumentKeySet>>,
    }

    impl TestMetadata {
        fn add_query_target(&self, target_id: TargetId, purpose: TargetPurpose) {
            let target = Query::new(ResourcePath::from_string("coll").unwrap()).to_target();
            self.targets
                .lock()
                .unwrap()
                .insert(target_id, TargetData::new(target, target_id, purpose, 0));
        }

        fn add_document_target(&self, target_id: TargetId, path: &str) {
            let target = Query::for_document(&key(path)).to_target();
            self.targets.lock().unwrap().insert(
                target_id,
                TargetData::new(target, target_id, TargetPurpose::LimboResolution, 0),
            );
        }

        fn set_remote_keys(&self, target_id: TargetId, keys: &[&str]) {
            let keys = keys.iter().map(|path| key(path)).collect();
            self.remote_keys.lock().unwrap().insert(target_id, keys);
        }
    }

    impl TargetMetadataProvider for TestMetadata {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.remote_keys
                .lock()
                .unwrap()
                .get(&target_id)
                .cloned()
                .unwrap_or_default()
        }

        fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.lock().unwrap().get(&target_id).cloned()
        }
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, seconds: i64) -> MutableDocument {
        MutableDocument::new_found_document(key(path), version(seconds), ObjectValue::empty())
    }

    fn aggregator(metadata: &Arc<TestMetadata>) -> WatchChangeAggregator {
        WatchChangeAggregator::new(metadata.clone(), DatabaseId::new("p", "d"))
    }

    fn doc_change(target_ids: Vec<TargetId>, removed: Vec<TargetId>, document: MutableDocument) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: target_ids,
            removed_target_ids: removed,
            key: document.key().clone(),
            new_doc: Some(document),
        }
    }

    #[test]
    fn aggregates_added_and_modified_documents() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.add_query_target(2, TargetPurpose::Listen);
        metadata.set_remote_keys(2, &["coll/existing"]);
        let mut aggregator = aggregator(&metadata);

        aggregator.handle_document_change(doc_change(vec![2], vec![], doc("coll/new", 1)));
        aggregator.handle_document_change(doc_change(vec![2], vec![], doc("coll/existing", 1)));
        aggregator.handle_target_change(
            &WatchTargetChange::new(WatchTargetChangeState::Current, vec![2]).with_resume_token(vec![7]),
        );

        let event = aggregator.create_remote_event(version(3));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![7]);
        assert!(change.added_documents.contains(&key("coll/new")));
        assert!(change.modified_documents.contains(&key("coll/existing")));
        assert_eq!(event.document_updates.len(), 2);
        assert_eq!(event.document_updates.get(&key("coll/new")).unwrap().read_time(), version(3));
        assert!(event.resolved_limbo_documents.is_empty());

        // Accumulators are cleared after each event.
        let next = aggregator.create_remote_event(version(4));
        assert!(next.target_changes.is_empty());
        assert!(next.document_updates.is_empty());
    }

    #[test]
    fn pending_targets_ignore_changes() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.add_query_target(2, TargetPurpose::Listen);
        let mut aggregator = aggregator(&metadata);

        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(doc_change(vec![2], vec![], doc("coll/a", 1)));
        assert!(aggregator.create_remote_event(version(1)).document_updates.is_empty());

        aggregator.handle_target_change(&WatchTargetChange::new(WatchTargetChangeState::Added, vec![2]));
        aggregator.handle_document_change(doc_change(vec![2], vec![], doc("coll/a", 2)));
        let event = aggregator.create_remote_event(version(2));
        assert!(event.target_changes[&2].added_documents.contains(&key("coll/a")));
    }

    #[test]
    fn removed_then_added_document_cancels_out() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.add_query_target(2, TargetPurpose::Listen);
        let mut aggregator = aggregator(&metadata);

        aggregator.handle_document_change(doc_change(vec![2], vec![], doc("coll/a", 1)));
        aggregator.handle_document_change(DocumentWatchChange {
            updated_target_ids: vec![],
            removed_target_ids: vec![2],
            key: key("coll/a"),
            new_doc: None,
        });
        let event = aggregator.create_remote_event(version(2));
        let change = &event.target_changes[&2];
        assert!(change.added_documents.is_empty());
        assert!(change.removed_documents.is_empty());
    }

    #[test]
    fn existence_filter_mismatch_without_bloom_filter_resets_target() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.add_query_target(2, TargetPurpose::Listen);
        metadata.set_remote_keys(2, &["coll/a", "coll/b"]);
        let mut aggregator = aggregator(&metadata);

        aggregator.handle_existence_filter(&ExistenceFilterChange {
            target_id: 2,
            existence_filter: ExistenceFilter::new(1),
        });
        let event = aggregator.create_remote_event(version(2));
        assert_eq!(event.target_mismatches.get(&2), Some(&TargetPurpose::ExistenceFilterMismatch));
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents.len(), 2);
        assert!(!change.current);
    }

    #[test]
    fn matching_existence_filter_is_ignored() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.add_query_target(2, TargetPurpose::Listen);
        metadata.set_remote_keys(2, &["coll/a"]);
        let mut aggregator = aggregator(&metadata);

        aggregator.handle_existence_filter(&ExistenceFilterChange {
            target_id: 2,
            existence_filter: ExistenceFilter::new(1),
        });
        let event = aggregator.create_remote_event(version(2));
        assert!(event.target_mismatches.is_empty());
        assert!(event.target_changes[&2].removed_documents.is_empty());
    }

    #[test]
    fn bloom_filter_removes_non_members_without_reset() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.add_query_target(2, TargetPurpose::Listen);
        metadata.set_remote_keys(2, &["coll/a", "coll/b"]);
        let mut aggregator = aggregator(&metadata);

        let root = DatabaseId::new("p", "d").documents_root();
        let mut filter = BloomFilter::new(vec![0; 32], 0, 3).unwrap();
        filter.insert(&format!("{root}/coll/a"));
        assert!(!filter.might_contain(&format!("{root}/coll/b")));
        let bitmap = filter.bitmap().to_vec();

        aggregator.handle_existence_filter(&ExistenceFilterChange {
            target_id: 2,
            existence_filter: ExistenceFilter {
                count: 1,
                unchanged_names: Some(BloomFilterProto {
                    bitmap,
                    padding: 0,
                    hash_count: 3,
                }),
            },
        });
        let event = aggregator.create_remote_event(version(2));
        assert!(event.target_mismatches.is_empty());
        let change = &event.target_changes[&2];
        assert!(change.removed_documents.contains(&key("coll/b")));
        assert!(!change.removed_documents.contains(&key("coll/a")));
    }

    #[test]
    fn bloom_filter_false_positive_resets_with_bloom_purpose() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.add_query_target(2, TargetPurpose::Listen);
        metadata.set_remote_keys(2, &["coll/a", "coll/b", "coll/c"]);
        let mut aggregator = aggregator(&metadata);

        // A saturated filter claims every document still matches.
        aggregator.handle_existence_filter(&ExistenceFilterChange {
            target_id: 2,
            existence_filter: ExistenceFilter {
                count: 1,
                unchanged_names: Some(BloomFilterProto {
                    bitmap: vec![0xff; 4],
                    padding: 0,
                    hash_count: 2,
                }),
            },
        });
        let event = aggregator.create_remote_event(version(2));
        assert_eq!(
            event.target_mismatches.get(&2),
            Some(&TargetPurpose::ExistenceFilterMismatchBloom)
        );
    }

    #[test]
    fn current_document_target_without_document_synthesizes_delete() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.add_document_target(1, "coll/missing");
        let mut aggregator = aggregator(&metadata);

        aggregator.handle_target_change(&WatchTargetChange::new(WatchTargetChangeState::Current, vec![1]));
        let event = aggregator.create_remote_event(version(5));
        let deleted = event.document_updates.get(&key("coll/missing")).unwrap();
        assert!(deleted.is_no_document());
        assert_eq!(deleted.version(), version(5));
        assert!(event.resolved_limbo_documents.contains(&key("coll/missing")));
    }

    #[test]
    fn document_target_deletes_are_decided_per_target() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.add_query_target(2, TargetPurpose::Listen);
        metadata.add_document_target(1, "coll/a");
        let mut aggregator = aggregator(&metadata);

        // Only the query target reports the document.
        aggregator.handle_document_change(doc_change(vec![2], vec![], doc("coll/a", 1)));
        aggregator.handle_target_change(&WatchTargetChange::new(WatchTargetChangeState::Current, vec![1, 2]));
        let event = aggregator.create_remote_event(version(3));
        assert!(event.target_changes[&2].added_documents.contains(&key("coll/a")));
        assert!(event.document_updates.get(&key("coll/a")).unwrap().is_no_document());

        // Reported by the document target itself, the document stands.
        aggregator.handle_document_change(doc_change(vec![1, 2], vec![], doc("coll/a", 4)));
        let event = aggregator.create_remote_event(version(4));
        assert!(event.document_updates.get(&key("coll/a")).unwrap().is_found_document());
        assert!(event.target_changes[&1].added_documents.contains(&key("coll/a")));
    }

    #[test]
    fn zero_count_filter_on_document_target_deletes_document() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.add_document_target(1, "coll/a");
        metadata.set_remote_keys(1, &["coll/a"]);
        let mut aggregator = aggregator(&metadata);

        aggregator.handle_existence_filter(&ExistenceFilterChange {
            target_id: 1,
            existence_filter: ExistenceFilter::new(0),
        });
        let event = aggregator.create_remote_event(version(2));
        assert!(event.document_updates.get(&key("coll/a")).unwrap().is_no_document());
        assert!(event.target_changes[&1].removed_documents.contains(&key("coll/a")));
    }

    #[test]
    fn global_no_change_updates_resume_tokens() {
        let metadata = Arc::new(TestMetadata::default());
        metadata.add_query_target(2, TargetPurpose::Listen);
        metadata.add_query_target(4, TargetPurpose::Listen);
        let mut aggregator = aggregator(&metadata);
        aggregator.handle_target_change(&WatchTargetChange::new(WatchTargetChangeState::Current, vec![2, 4]));
        aggregator.create_remote_event(version(1));

        aggregator.handle_target_change(
            &WatchTargetChange::new(WatchTargetChangeState::NoChange, vec![]).with_resume_token(vec![9]),
        );
        let event = aggregator.create_remote_event(version(2));
        assert_eq!(event.target_changes[&2].resume_token, vec![9]);
        assert_eq!(event.target_changes[&4].resume_token, vec![9]);
        assert!(event.target_changes[&4].current);
    }
}
