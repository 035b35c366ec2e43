use std::collections::BTreeMap;

use crate::firestore::core::{ChangeType, DocumentSet, ViewSnapshot};
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DocumentKey, IntoFieldPath, MutableDocument};
use crate::firestore::value::{FirestoreValue, ValueKind};

use super::database::Firestore;
use super::query::Query;
use super::reference::DocumentReference;

/// Metadata about the state of a snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    /// The snapshot contains local writes that have not been committed yet.
    pub has_pending_writes: bool,
    /// The snapshot was built from cached data and may be stale.
    pub from_cache: bool,
}

impl SnapshotMetadata {
    pub fn new(has_pending_writes: bool, from_cache: bool) -> Self {
        Self {
            has_pending_writes,
            from_cache,
        }
    }
}

/// How server timestamps that have not been committed yet are read.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerTimestampBehavior {
    /// Read as `null`.
    #[default]
    None,
    /// Read as the local time of the write.
    Estimate,
    /// Read as the field's value before the write, or `null`.
    Previous,
}

#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    firestore: Firestore,
    key: DocumentKey,
    document: Option<MutableDocument>,
    metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    /// `document` is kept only when it is a found document.
    pub(crate) fn new(
        firestore: Firestore,
        key: DocumentKey,
        document: Option<MutableDocument>,
        metadata: SnapshotMetadata,
    ) -> Self {
        Self {
            firestore,
            key,
            document: document.filter(MutableDocument::is_found_document),
            metadata,
        }
    }

    pub fn exists(&self) -> bool {
        self.document.is_some()
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn reference(&self) -> DocumentReference {
        DocumentReference::from_key(self.firestore.clone(), self.key.clone())
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// The document fields, or `None` when the document does not exist.
    /// Pending server timestamps read as `null`.
    pub fn data(&self) -> Option<BTreeMap<String, FirestoreValue>> {
        self.data_with_options(ServerTimestampBehavior::None)
    }

    pub fn data_with_options(&self, behavior: ServerTimestampBehavior) -> Option<BTreeMap<String, FirestoreValue>> {
        let document = self.document.as_ref()?;
        Some(
            document
                .data()
                .fields()
                .iter()
                .map(|(key, value)| (key.clone(), resolve_server_timestamps(value, behavior)))
                .collect(),
        )
    }

    /// Reads one field. Returns `None` when the document or the field is
    /// missing.
    pub fn get(&self, field: impl IntoFieldPath) -> FirestoreResult<Option<FirestoreValue>> {
        self.get_with_options(field, ServerTimestampBehavior::None)
    }

    pub fn get_with_options(
        &self,
        field: impl IntoFieldPath,
        behavior: ServerTimestampBehavior,
    ) -> FirestoreResult<Option<FirestoreValue>> {
        let path = field.into_field_path()?;
        Ok(self
            .document
            .as_ref()
            .and_then(|document| document.field(&path))
            .map(|value| resolve_server_timestamps(value, behavior)))
    }
}

impl PartialEq for DocumentSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && self.metadata == other.metadata
            && self.document.as_ref().map(MutableDocument::data) == other.document.as_ref().map(MutableDocument::data)
    }
}

fn resolve_server_timestamps(value: &FirestoreValue, behavior: ServerTimestampBehavior) -> FirestoreValue {
    match value.kind() {
        ValueKind::ServerTimestamp {
            local_write_time,
            previous_value,
        } => match behavior {
            ServerTimestampBehavior::None => FirestoreValue::null(),
            ServerTimestampBehavior::Estimate => FirestoreValue::from_timestamp(*local_write_time),
            ServerTimestampBehavior::Previous => previous_value
                .as_deref()
                .map(|previous| resolve_server_timestamps(previous, behavior))
                .unwrap_or_else(FirestoreValue::null),
        },
        ValueKind::Map(map) => FirestoreValue::from_map(
            map.fields()
                .iter()
                .map(|(key, value)| (key.clone(), resolve_server_timestamps(value, behavior)))
                .collect(),
        ),
        ValueKind::Array(array) => FirestoreValue::from_array(
            array
                .values()
                .iter()
                .map(|value| resolve_server_timestamps(value, behavior))
                .collect(),
        ),
        _ => value.clone(),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentChangeType {
    Added,
    Modified,
    Removed,
}

/// One document's change between two query snapshots.
#[derive(Clone, Debug)]
pub struct DocumentChange {
    pub change_type: DocumentChangeType,
    pub doc: DocumentSnapshot,
    /// Position in the previous snapshot; `None` for added documents.
    pub old_index: Option<usize>,
    /// Position in this snapshot; `None` for removed documents.
    pub new_index: Option<usize>,
}

/// The results of a query at one point in time.
#[derive(Clone, Debug)]
pub struct QuerySnapshot {
    query: Query,
    snapshot: ViewSnapshot,
    metadata: SnapshotMetadata,
}

impl QuerySnapshot {
    pub(crate) fn new(query: Query, snapshot: ViewSnapshot) -> Self {
        let metadata = SnapshotMetadata::new(snapshot.has_pending_writes(), snapshot.from_cache);
        Self {
            query,
            snapshot,
            metadata,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// Documents in query order.
    pub fn documents(&self) -> Vec<DocumentSnapshot> {
        self.snapshot.docs.iter().map(|doc| self.document_snapshot(doc)).collect()
    }

    pub fn len(&self) -> usize {
        self.snapshot.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.docs.is_empty()
    }

    /// Changes since the previous snapshot delivered to the same listener.
    /// Metadata-only changes are reported as `Modified` when requested.
    pub fn doc_changes(&self, include_metadata_changes: bool) -> Vec<DocumentChange> {
        if self.snapshot.old_docs.is_empty() {
            return self
                .snapshot
                .doc_changes
                .iter()
                .enumerate()
                .map(|(index, change)| DocumentChange {
                    change_type: DocumentChangeType::Added,
                    doc: self.document_snapshot(&change.doc),
                    old_index: None,
                    new_index: Some(index),
                })
                .collect();
        }

        let mut index_tracker: DocumentSet = self.snapshot.old_docs.clone();
        let mut changes = Vec::new();
        for change in &self.snapshot.doc_changes {
            if !include_metadata_changes && change.change_type == ChangeType::Metadata {
                continue;
            }
            let key = change.doc.key();
            let mut old_index = None;
            let mut new_index = None;
            if change.change_type != ChangeType::Added {
                old_index = index_tracker.index_of(key);
                index_tracker = index_tracker.remove(key);
            }
            if change.change_type != ChangeType::Removed {
                index_tracker = index_tracker.insert(change.doc.clone());
                new_index = index_tracker.index_of(key);
            }
            let change_type = match change.change_type {
                ChangeType::Added => DocumentChangeType::Added,
                ChangeType::Modified | ChangeType::Metadata => DocumentChangeType::Modified,
                ChangeType::Removed => DocumentChangeType::Removed,
            };
            changes.push(DocumentChange {
                change_type,
                doc: self.document_snapshot(&change.doc),
                old_index,
                new_index,
            });
        }
        changes
    }

    fn document_snapshot(&self, doc: &MutableDocument) -> DocumentSnapshot {
        let metadata = SnapshotMetadata::new(self.snapshot.mutated_keys.contains(doc.key()), self.snapshot.from_cache);
        DocumentSnapshot::new(
            self.query.firestore().clone(),
            doc.key().clone(),
            Some(doc.clone()),
            metadata,
        )
    }
}

impl IntoIterator for QuerySnapshot {
    type Item = DocumentSnapshot;
    type IntoIter = std::vec::IntoIter<DocumentSnapshot>;

    fn into_iter(self) -> Self::IntoIter {
        self.documents().into_iter()
    }
}

/// The document snapshot for `key` contained in a view snapshot of a
/// single-document query.
pub(crate) fn document_snapshot_from_view(
    firestore: &Firestore,
    key: &DocumentKey,
    snapshot: &ViewSnapshot,
) -> DocumentSnapshot {
    let document = snapshot.docs.get(key).cloned();
    let metadata = SnapshotMetadata::new(snapshot.mutated_keys.contains(key), snapshot.from_cache);
    DocumentSnapshot::new(firestore.clone(), key.clone(), document, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::api::test_firestore;
    use crate::firestore::core::{DocumentViewChange, Query as CoreQuery};
    use crate::firestore::model::{DocumentKeySet, FieldPath, ObjectValue, ResourcePath, SnapshotVersion, Timestamp};

    fn doc(path: &str, value: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("value").unwrap(), FirestoreValue::from_integer(value));
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::new(Timestamp::new(1, 0)),
            data,
        )
    }

    fn rooms() -> CoreQuery {
        CoreQuery::new(ResourcePath::from_segments(["rooms"]))
    }

    #[test]
    fn initial_snapshot_reports_additions_in_order() {
        let firestore = test_firestore();
        let docs = DocumentSet::new(rooms().comparator())
            .insert(doc("rooms/b", 2))
            .insert(doc("rooms/a", 1));
        let view = ViewSnapshot::from_initial_documents(rooms(), docs, DocumentKeySet::new(), true, false);
        let snapshot = QuerySnapshot::new(Query::from_core(firestore, rooms()), view);

        assert!(snapshot.metadata().from_cache);
        let ids: Vec<String> = snapshot.documents().iter().map(|doc| doc.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        let changes = snapshot.doc_changes(false);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].new_index, Some(1));
        assert!(changes.iter().all(|change| change.old_index.is_none()));
    }

    #[test]
    fn later_snapshots_track_indexes() {
        let firestore = test_firestore();
        let old_docs = DocumentSet::new(rooms().comparator())
            .insert(doc("rooms/a", 1))
            .insert(doc("rooms/b", 2));
        let docs = old_docs.remove(&DocumentKey::from_string("rooms/a").unwrap()).insert(doc("rooms/c", 3));
        let mutated = DocumentKeySet::new().insert(DocumentKey::from_string("rooms/c").unwrap());
        let view = ViewSnapshot {
            query: rooms(),
            docs,
            old_docs,
            doc_changes: vec![
                DocumentViewChange::new(ChangeType::Removed, doc("rooms/a", 1)),
                DocumentViewChange::new(ChangeType::Added, doc("rooms/c", 3)),
                DocumentViewChange::new(ChangeType::Metadata, doc("rooms/b", 2)),
            ],
            mutated_keys: mutated,
            from_cache: false,
            sync_state_changed: false,
            excludes_metadata_changes: false,
            has_cached_results: true,
        };
        let snapshot = QuerySnapshot::new(Query::from_core(firestore, rooms()), view);
        assert!(snapshot.metadata().has_pending_writes);

        let changes = snapshot.doc_changes(false);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].change_type, DocumentChangeType::Removed);
        assert_eq!((changes[0].old_index, changes[0].new_index), (Some(0), None));
        assert_eq!(changes[1].change_type, DocumentChangeType::Added);
        assert_eq!(changes[1].new_index, Some(1));
        assert!(changes[1].doc.metadata().has_pending_writes);

        let with_metadata = snapshot.doc_changes(true);
        assert_eq!(with_metadata.len(), 3);
        assert_eq!(with_metadata[2].change_type, DocumentChangeType::Modified);
    }

    #[test]
    fn pending_server_timestamps_follow_behavior() {
        let firestore = test_firestore();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let mut data = ObjectValue::empty();
        let field = FieldPath::from_dot_separated("at").unwrap();
        data.set(
            &field,
            FirestoreValue::server_timestamp_placeholder(Timestamp::new(5, 0), Some(FirestoreValue::from_integer(7))),
        );
        let document = MutableDocument::new_found_document(key.clone(), SnapshotVersion::min(), data);
        let snapshot = DocumentSnapshot::new(firestore, key, Some(document), SnapshotMetadata::new(true, true));

        assert!(snapshot.get("at").unwrap().unwrap().is_null());
        assert_eq!(
            snapshot.get_with_options("at", ServerTimestampBehavior::Estimate).unwrap(),
            Some(FirestoreValue::from_timestamp(Timestamp::new(5, 0)))
        );
        assert_eq!(
            snapshot.get_with_options("at", ServerTimestampBehavior::Previous).unwrap(),
            Some(FirestoreValue::from_integer(7))
        );
        assert!(snapshot.get("missing").unwrap().is_none());
    }

    #[test]
    fn missing_documents_do_not_exist() {
        let firestore = test_firestore();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let deleted = MutableDocument::new_no_document(key.clone(), SnapshotVersion::min());
        let snapshot = DocumentSnapshot::new(firestore, key, Some(deleted), SnapshotMetadata::default());
        assert!(!snapshot.exists());
        assert!(snapshot.data().is_none());
        assert_eq!(snapshot.reference().id(), "a");
    }
}
