use std::collections::BTreeMap;

use crate::firestore::core::target::TargetId;
use crate::firestore::local::target_data::TargetPurpose;
use crate::firestore::model::{DocumentKeySet, DocumentMap, SnapshotVersion};

/// Aggregated result of applying a batch of watch changes coming from the
/// backend, consistent as of `snapshot_version`.
#[derive(Debug, Clone)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match and must be re-listened.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    /// Updated documents. Deletions carry a `NoDocument` entry.
    pub document_updates: DocumentMap,
    /// Documents that only limbo resolution targets reference.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    pub fn new(snapshot_version: SnapshotVersion) -> Self {
        Self {
            snapshot_version,
            target_changes: BTreeMap::new(),
            target_mismatches: BTreeMap::new(),
            document_updates: DocumentMap::new(),
            resolved_limbo_documents: DocumentKeySet::new(),
        }
    }

    /// Event that marks a target as current without any document changes,
    /// used when a target is known to match nothing.
    pub fn synthesized_for_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> Self {
        let mut event = Self::new(SnapshotVersion::min());
        event
            .target_changes
            .insert(target_id, TargetChange::create_synthesized_target_change_for_current_change(current, resume_token));
        event
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Changes to one target since the last remote event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TargetChange {
    /// Opaque token to resume the target from. Empty when unchanged.
    pub resume_token: Vec<u8>,
    /// Whether the target is in sync with the backend as of this event.
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn create_synthesized_target_change_for_current_change(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_event_only_marks_current() {
        let event = RemoteEvent::synthesized_for_current_change(4, true, vec![1, 2]);
        assert!(!event.is_empty());
        let change = &event.target_changes[&4];
        assert!(change.current);
        assert_eq!(change.resume_token, vec![1, 2]);
        assert!(change.added_documents.is_empty());
        assert!(event.document_updates.is_empty());
    }
}
