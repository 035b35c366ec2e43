use std::cmp::Ordering;

use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::{DocumentComparator, LimitType, Query};
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view_snapshot::{
    ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot,
};
use crate::firestore::model::{DocumentKey, DocumentKeySet, DocumentMap, MutableDocument};
use crate::firestore::remote::TargetChange;
use crate::util::assert::hard_assert;

/// Change to the set of documents a view considers to be in limbo.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

impl LimboDocumentChange {
    pub fn key(&self) -> &DocumentKey {
        match self {
            LimboDocumentChange::Added(key) | LimboDocumentChange::Removed(key) => key,
        }
    }
}

/// Result of [`View::compute_doc_changes`], applied with [`View::apply_changes`].
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: DocumentKeySet,
    /// A document left a limited view and the view must be recomputed from
    /// the local store before the changes can be applied.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Maintains the result set of one query and turns document updates into
/// view snapshots.
pub struct View {
    query: Query,
    comparator: DocumentComparator,
    sync_state: Option<SyncState>,
    current: bool,
    document_set: DocumentSet,
    synced_documents: DocumentKeySet,
    limbo_documents: DocumentKeySet,
    mutated_keys: DocumentKeySet,
}

impl View {
    pub fn new(query: Query, synced_documents: DocumentKeySet) -> Self {
        let comparator = query.comparator();
        Self {
            document_set: DocumentSet::new(comparator.clone()),
            comparator,
            query,
            sync_state: None,
            current: false,
            synced_documents,
            limbo_documents: DocumentKeySet::new(),
            mutated_keys: DocumentKeySet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Keys the backend reported as part of this view's target.
    pub fn synced_documents(&self) -> &DocumentKeySet {
        &self.synced_documents
    }

    pub fn limbo_documents(&self) -> &DocumentKeySet {
        &self.limbo_documents
    }

    pub fn documents(&self) -> &DocumentSet {
        &self.document_set
    }

    /// Folds `doc_changes` into the view without applying them.
    ///
    /// `previous_changes` continues an earlier computation, used when a
    /// limited view is refilled from the local store.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &DocumentMap,
        previous_changes: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let had_previous = previous_changes.is_some();
        let (mut change_set, old_document_set, mut new_mutated_keys) = match previous_changes {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::new(),
                self.document_set.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_document_set = old_document_set.clone();
        let mut needs_refill = false;

        let limit = self.query.limit().map(|limit| limit as usize);
        let at_limit = limit == Some(old_document_set.len());
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_document_set.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_document_set.first().cloned(),
            _ => None,
        };

        for (key, entry) in doc_changes.iter() {
            let old_doc = old_document_set.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_had_pending = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_has_pending = new_doc.is_some_and(|doc| {
                doc.has_local_mutations() || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old), Some(new)) => {
                    if old.data() != new.data() {
                        if !should_wait_for_synced_document(old, new) {
                            change_set.track(DocumentViewChange::new(ChangeType::Modified, new.clone()));
                            change_applied = true;
                            let beyond_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| (self.comparator)(new, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| (self.comparator)(new, first) == Ordering::Less);
                            if beyond_last || before_first {
                                // The document moved outside the window; a
                                // document from the local cache may replace it.
                                needs_refill = true;
                            }
                        }
                    } else if old_had_pending != new_has_pending {
                        change_set.track(DocumentViewChange::new(ChangeType::Metadata, new.clone()));
                        change_applied = true;
                    }
                }
                (None, Some(new)) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Added, new.clone()));
                    change_applied = true;
                }
                (Some(old), None) => {
                    change_set.track(DocumentViewChange::new(ChangeType::Removed, old.clone()));
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new) => {
                        new_document_set = new_document_set.insert(new.clone());
                        new_mutated_keys = if new_has_pending {
                            new_mutated_keys.insert(key.clone())
                        } else {
                            new_mutated_keys.remove(key)
                        };
                    }
                    None => {
                        new_document_set = new_document_set.remove(key);
                        new_mutated_keys = new_mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_document_set.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => new_document_set.last(),
                    LimitType::Last => new_document_set.first(),
                }
                .cloned();
                let Some(evicted) = evicted else {
                    break;
                };
                new_document_set = new_document_set.remove(evicted.key());
                new_mutated_keys = new_mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange::new(ChangeType::Removed, evicted));
            }
        }

        hard_assert(
            !needs_refill || !had_previous,
            0xb7e8,
            "view was refilled using docs that themselves needed refilling",
        );

        ViewDocumentChanges {
            document_set: new_document_set,
            change_set,
            mutated_keys: new_mutated_keys,
            needs_refill,
        }
    }

    /// Applies computed changes and produces a snapshot when anything
    /// user-visible changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        hard_assert(!doc_changes.needs_refill, 0xf1c6, "cannot apply changes that need a refill");
        let old_docs = std::mem::replace(&mut self.document_set, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.changes();
        changes.sort_by(|left, right| {
            change_type_order(left.change_type)
                .cmp(&change_type_order(right.change_type))
                .then_with(|| (self.comparator)(&left.doc, &right.doc))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let snapshot = ViewSnapshot {
            query: self.query.clone(),
            docs: doc_changes.document_set,
            old_docs,
            doc_changes: changes,
            mutated_keys: doc_changes.mutated_keys,
            from_cache: new_sync_state == SyncState::Local,
            sync_state_changed,
            excludes_metadata_changes: false,
            has_cached_results: target_change.is_some_and(|change| !change.resume_token.is_empty()),
        };
        ViewChange {
            snapshot: Some(snapshot),
            limbo_changes,
        }
    }

    /// Going offline marks a current view as no longer current so listeners
    /// see results as coming from the cache.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let changes = ViewDocumentChanges {
                document_set: self.document_set.clone(),
                change_set: DocumentChangeSet::new(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            self.apply_changes(changes, false, None, false)
        } else {
            ViewChange::default()
        }
    }

    /// Resets the view's synced keys to `remote_keys` and recomputes its
    /// contents from `documents`.
    pub fn synchronize_with_persisted_state(
        &mut self,
        documents: &DocumentMap,
        remote_keys: DocumentKeySet,
    ) -> ViewChange {
        self.synced_documents = remote_keys;
        self.limbo_documents = DocumentKeySet::new();
        let changes = self.compute_doc_changes(documents, None);
        self.apply_changes(changes, true, None, false)
    }

    /// Snapshot describing every document currently in the view as added.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.document_set.clone(),
            self.mutated_keys.clone(),
            self.sync_state == Some(SyncState::Local),
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        for key in change.added_documents.iter() {
            self.synced_documents = self.synced_documents.insert(key.clone());
        }
        for key in change.removed_documents.iter() {
            self.synced_documents = self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn should_be_in_limbo(&self, key: &DocumentKey) -> bool {
        if self.synced_documents.contains(key) {
            return false;
        }
        match self.document_set.get(key) {
            // Locally written documents are not expected on the backend yet.
            Some(doc) => !doc.has_local_mutations(),
            None => false,
        }
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let mut limbo = DocumentKeySet::new();
        for key in self.document_set.keys() {
            if self.should_be_in_limbo(key) {
                limbo = limbo.insert(key.clone());
            }
        }
        self.limbo_documents = limbo;

        let mut changes = Vec::new();
        for key in old_limbo.iter() {
            if !self.limbo_documents.contains(key) {
                changes.push(LimboDocumentChange::Removed(key.clone()));
            }
        }
        for key in self.limbo_documents.iter() {
            if !old_limbo.contains(key) {
                changes.push(LimboDocumentChange::Added(key.clone()));
            }
        }
        changes
    }
}

fn should_wait_for_synced_document(old: &MutableDocument, new: &MutableDocument) -> bool {
    // A local write was acknowledged but watch has not delivered the new
    // version yet; keep showing the optimistic state.
    old.has_local_mutations() && new.has_committed_mutations() && !new.has_local_mutations()
}

fn change_type_order(change_type: ChangeType) -> u8 {
    match change_type {
        ChangeType::Removed => 0,
        ChangeType::Added => 1,
        ChangeType::Modified | ChangeType::Metadata => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{Direction, OrderBy};
    use crate::firestore::model::{FieldPath, ObjectValue, ResourcePath, SnapshotVersion};
    use crate::firestore::value::FirestoreValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn doc(path: &str, n: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
        MutableDocument::new_found_document(key(path), SnapshotVersion::min(), data)
    }

    fn docs(entries: Vec<MutableDocument>) -> DocumentMap {
        entries
            .into_iter()
            .fold(DocumentMap::new(), |map, doc| map.insert(doc.key().clone(), doc))
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn target_change(current: bool, added: &[&str]) -> TargetChange {
        TargetChange {
            resume_token: Vec::new(),
            current,
            added_documents: added.iter().map(|p| key(p)).collect(),
            modified_documents: DocumentKeySet::new(),
            removed_documents: DocumentKeySet::new(),
        }
    }

    #[test]
    fn first_changes_produce_added_snapshot() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let changes = view.compute_doc_changes(&docs(vec![doc("rooms/a", 1), doc("rooms/b", 2)]), None);
        let snapshot = view.apply_changes(changes, true, None, false).snapshot.unwrap();
        assert_eq!(snapshot.docs.len(), 2);
        assert!(snapshot.from_cache);
        assert!(snapshot
            .doc_changes
            .iter()
            .all(|change| change.change_type == ChangeType::Added));
    }

    #[test]
    fn limit_evicts_and_requests_refill() {
        let query = rooms()
            .with_order_by(OrderBy::new(FieldPath::from_dot_separated("n").unwrap(), Direction::Ascending))
            .with_limit_to_first(2);
        let mut view = View::new(query, DocumentKeySet::new());
        let changes = view.compute_doc_changes(
            &docs(vec![doc("rooms/a", 1), doc("rooms/b", 2), doc("rooms/c", 3)]),
            None,
        );
        assert_eq!(changes.document_set.len(), 2);
        assert!(!changes.document_set.contains(&key("rooms/c")));
        view.apply_changes(changes, true, None, false);

        let mut removed = MutableDocument::new_no_document(key("rooms/a"), SnapshotVersion::min());
        removed.set_read_time(SnapshotVersion::min());
        let changes = view.compute_doc_changes(&docs(vec![removed]), None);
        assert!(changes.needs_refill);
    }

    #[test]
    fn unsynced_documents_go_into_limbo_once_current() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let changes = view.compute_doc_changes(&docs(vec![doc("rooms/a", 1), doc("rooms/b", 1)]), None);
        let change = target_change(true, &["rooms/a"]);
        let result = view.apply_changes(changes, true, Some(&change), false);
        assert_eq!(result.limbo_changes, vec![LimboDocumentChange::Added(key("rooms/b"))]);
        assert!(result.snapshot.unwrap().from_cache);
    }

    #[test]
    fn synced_view_is_not_from_cache_until_offline() {
        let mut view = View::new(rooms(), DocumentKeySet::new());
        let changes = view.compute_doc_changes(&docs(vec![doc("rooms/a", 1)]), None);
        let change = target_change(true, &["rooms/a"]);
        let snapshot = view.apply_changes(changes, true, Some(&change), false).snapshot.unwrap();
        assert!(!snapshot.from_cache);

        let offline = view.apply_online_state_change(OnlineState::Offline).snapshot.unwrap();
        assert!(offline.from_cache);
        assert!(offline.doc_changes.is_empty());
        assert!(offline.sync_state_changed);
    }
}
