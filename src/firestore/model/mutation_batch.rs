use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, DocumentKeySet, FieldMask, MutableDocument, Mutation,
    MutationResult, OverlayedDocument, SnapshotVersion, Timestamp,
};
use crate::util::assert::hard_assert;
use crate::util::SortedMap;

/// Sentinel batch id meaning "no batch".
pub const BATCH_ID_UNKNOWN: i32 = -1;

/// Mutations written together by one user operation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: i32,
    pub local_write_time: Timestamp,
    /// Mutations that capture base values for idempotent transforms. Applied
    /// to the local view only, never sent to the backend.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: i32,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        hard_assert(!mutations.is_empty(), 0x1bd6, "cannot create an empty mutation batch");
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    /// Applies this batch's acknowledged results to the cached copy of
    /// `document`.
    pub fn apply_to_remote_document(&self, document: &mut MutableDocument, result: &MutationBatchResult) {
        hard_assert(
            result.mutation_results.len() == self.mutations.len(),
            0x1a2d,
            format!(
                "mismatched number of mutation results: {} results for {} mutations",
                result.mutation_results.len(),
                self.mutations.len()
            ),
        );
        for (mutation, mutation_result) in self.mutations.iter().zip(&result.mutation_results) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }

    /// Applies every mutation touching `document` to its local view and
    /// returns the accumulated field mask.
    pub fn apply_to_local_view(
        &self,
        document: &mut MutableDocument,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(&self.mutations) {
            if mutation.key() == document.key() {
                mutated_fields = mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to a set of overlayed documents and returns the
    /// overlay each touched key should now store.
    ///
    /// Keys in `documents_without_remote_version` have never been seen by the
    /// backend, so their overlays must replace the whole document.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for mutation in &self.mutations {
            let key = mutation.key();
            let Some(overlayed) = documents.get_mut(key) else {
                continue;
            };
            let mutated_fields = self.apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.take());
            let mutated_fields = if documents_without_remote_version.contains(key) {
                None
            } else {
                mutated_fields
            };
            overlayed.mutated_fields = mutated_fields.clone();
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mutated_fields.as_ref()) {
                overlays.insert(key.clone(), overlay);
            }
            if !overlayed.document.is_valid_document() {
                overlayed.document.convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations
            .iter()
            .map(|mutation| mutation.key().clone())
            .collect()
    }
}

/// Per-document versions assigned by a commit.
pub type DocumentVersionMap = SortedMap<DocumentKey, SnapshotVersion>;

/// A batch together with the backend's response to it.
#[derive(Clone, Debug)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    pub doc_versions: DocumentVersionMap,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> Self {
        hard_assert(
            batch.mutations.len() == mutation_results.len(),
            0xe555,
            format!(
                "mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            ),
        );
        let mut doc_versions = DocumentVersionMap::new();
        for (mutation, result) in batch.mutations.iter().zip(&mutation_results) {
            doc_versions = doc_versions.insert(mutation.key().clone(), result.version);
        }
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, ObjectValue, Precondition};
    use crate::firestore::value::FirestoreValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn path(text: &str) -> FieldPath {
        FieldPath::from_dot_separated(text).unwrap()
    }

    fn data(field: &str, value: i64) -> ObjectValue {
        let mut object = ObjectValue::empty();
        object.set(&path(field), FirestoreValue::from_integer(value));
        object
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn local_view_only_touches_matching_keys() {
        let batch = MutationBatch::new(
            1,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![
                Mutation::set(key("c/a"), data("x", 1)),
                Mutation::set(key("c/b"), data("y", 2)),
            ],
        );
        let mut doc = MutableDocument::new_invalid_document(key("c/a"));
        let mask = batch.apply_to_local_view(&mut doc, Some(FieldMask::empty()));
        assert!(mask.is_none());
        assert_eq!(doc.field(&path("x")), Some(&FirestoreValue::from_integer(1)));
        assert!(doc.field(&path("y")).is_none());
        assert_eq!(batch.keys().len(), 2);
    }

    #[test]
    fn local_document_set_produces_overlays() {
        let batch = MutationBatch::new(
            3,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![Mutation::patch(
                key("c/a"),
                data("x", 5),
                FieldMask::new([path("x")]),
                Precondition::None,
            )],
        );
        let mut documents = BTreeMap::new();
        documents.insert(
            key("c/a"),
            OverlayedDocument::new(
                MutableDocument::new_found_document(key("c/a"), version(1), data("y", 1)),
                Some(FieldMask::empty()),
            ),
        );
        let overlays = batch.apply_to_local_document_set(&mut documents, &BTreeSet::new());
        match overlays.get(&key("c/a")) {
            Some(Mutation::Patch { mask, .. }) => assert!(mask.covers(&path("x"))),
            other => panic!("unexpected overlay {other:?}"),
        }
    }

    #[test]
    fn documents_without_remote_version_get_set_overlays() {
        let batch = MutationBatch::new(
            3,
            Timestamp::new(1, 0),
            Vec::new(),
            vec![Mutation::patch(
                key("c/a"),
                data("x", 5),
                FieldMask::new([path("x")]),
                Precondition::None,
            )],
        );
        let mut documents = BTreeMap::new();
        documents.insert(
            key("c/a"),
            OverlayedDocument::new(MutableDocument::new_invalid_document(key("c/a")), Some(FieldMask::empty())),
        );
        let without_version: BTreeSet<_> = [key("c/a")].into_iter().collect();
        let overlays = batch.apply_to_local_document_set(&mut documents, &without_version);
        assert!(matches!(overlays.get(&key("c/a")), Some(Mutation::Set { .. })));
    }

    #[test]
    fn batch_result_tracks_versions() {
        let batch = MutationBatch::new(1, Timestamp::new(1, 0), Vec::new(), vec![Mutation::delete(key("c/a"))]);
        let result = MutationBatchResult::from(
            batch.clone(),
            version(7),
            vec![MutationResult::new(version(7), Vec::new())],
            b"token".to_vec(),
        );
        assert_eq!(result.doc_versions.get(&key("c/a")), Some(&version(7)));

        let mut doc = MutableDocument::new_found_document(key("c/a"), version(1), ObjectValue::empty());
        batch.apply_to_remote_document(&mut doc, &result);
        assert!(doc.is_no_document());
        assert!(doc.has_committed_mutations());
    }
}
