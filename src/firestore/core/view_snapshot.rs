use std::collections::BTreeMap;

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::Query;
use crate::firestore::model::{DocumentKey, DocumentKeySet, MutableDocument};
use crate::util::assert::fail;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the metadata (pending writes, cache state) changed.
    Metadata,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub doc: MutableDocument,
}

impl DocumentViewChange {
    pub fn new(change_type: ChangeType, doc: MutableDocument) -> Self {
        Self { change_type, doc }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    Local,
    Synced,
}

/// Accumulates view changes per key, folding successive changes to the same
/// document into their net effect.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.doc.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };
        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange::new(old_type, change.doc)),
            (Modified, Modified) => Some(DocumentViewChange::new(Modified, change.doc)),
            (Added, Modified) => Some(DocumentViewChange::new(Added, change.doc)),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange::new(Removed, old.doc.clone())),
            (Removed, Added) => Some(DocumentViewChange::new(Modified, change.doc)),
            (old_type, new_type) => fail(
                0x0153,
                format!("unsupported change {new_type:?} after {old_type:?} for key {key}"),
            ),
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    /// Net changes in key order.
    pub fn changes(&self) -> Vec<DocumentViewChange> {
        self.changes.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// The state of a query's results at one point in time, together with what
/// changed since the previous snapshot.
#[derive(Clone, Debug)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// A first snapshot in which every document counts as added.
    pub fn from_initial_documents(
        query: Query,
        docs: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = docs
            .iter()
            .map(|doc| DocumentViewChange::new(ChangeType::Added, doc.clone()))
            .collect();
        Self {
            query,
            old_docs: docs.empty_like(),
            docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }
}

impl PartialEq for ViewSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.from_cache == other.from_cache
            && self.has_cached_results == other.has_cached_results
            && self.sync_state_changed == other.sync_state_changed
            && self.mutated_keys == other.mutated_keys
            && self.query == other.query
            && self.docs == other.docs
            && self.old_docs == other.old_docs
            && self.doc_changes == other.doc_changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{ObjectValue, SnapshotVersion};

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            ObjectValue::empty(),
        )
    }

    fn change(change_type: ChangeType) -> DocumentViewChange {
        DocumentViewChange::new(change_type, doc("c/a"))
    }

    fn fold(first: ChangeType, second: ChangeType) -> Vec<ChangeType> {
        let mut set = DocumentChangeSet::new();
        set.track(change(first));
        set.track(change(second));
        set.changes().into_iter().map(|c| c.change_type).collect()
    }

    #[test]
    fn folds_successive_changes() {
        assert_eq!(fold(ChangeType::Added, ChangeType::Removed), vec![]);
        assert_eq!(fold(ChangeType::Removed, ChangeType::Added), vec![ChangeType::Modified]);
        assert_eq!(fold(ChangeType::Added, ChangeType::Modified), vec![ChangeType::Added]);
        assert_eq!(fold(ChangeType::Modified, ChangeType::Removed), vec![ChangeType::Removed]);
        assert_eq!(fold(ChangeType::Metadata, ChangeType::Modified), vec![ChangeType::Modified]);
        assert_eq!(fold(ChangeType::Modified, ChangeType::Metadata), vec![ChangeType::Modified]);
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERTION FAILED")]
    fn rejects_added_after_added() {
        fold(ChangeType::Added, ChangeType::Added);
    }
}
