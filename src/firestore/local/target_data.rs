use crate::firestore::core::target::{Target, TargetId};
use crate::firestore::core::types::ListenSequenceNumber;
use crate::firestore::model::SnapshotVersion;

/// Why a target is being listened to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetPurpose {
    /// A user query.
    Listen,
    /// Re-listen after an existence filter disagreed with the local count.
    ExistenceFilterMismatch,
    /// Re-listen after an existence filter whose bloom filter could not
    /// account for the difference.
    ExistenceFilterMismatchBloom,
    /// A single document whose existence is being re-confirmed.
    LimboResolution,
}

/// Everything the client tracks about one listen target.
#[derive(Clone, Debug, PartialEq)]
pub struct TargetData {
    pub target: Target,
    pub target_id: TargetId,
    pub purpose: TargetPurpose,
    pub sequence_number: ListenSequenceNumber,
    /// Version of the last consistent snapshot received for this target.
    pub snapshot_version: SnapshotVersion,
    /// Last version at which the target had no limbo documents. Queries can
    /// skip the remote documents that changed before it.
    pub last_limbo_free_snapshot_version: SnapshotVersion,
    pub resume_token: Vec<u8>,
    /// Document count the backend is expected to report on resume, sent so
    /// it can reply with an existence filter.
    pub expected_count: Option<i32>,
}

impl TargetData {
    pub fn new(
        target: Target,
        target_id: TargetId,
        purpose: TargetPurpose,
        sequence_number: ListenSequenceNumber,
    ) -> Self {
        Self {
            target,
            target_id,
            purpose,
            sequence_number,
            snapshot_version: SnapshotVersion::min(),
            last_limbo_free_snapshot_version: SnapshotVersion::min(),
            resume_token: Vec::new(),
            expected_count: None,
        }
    }

    pub fn with_sequence_number(&self, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            sequence_number,
            ..self.clone()
        }
    }

    /// A copy carrying a new resume token. Clears any expected count.
    pub fn with_resume_token(&self, resume_token: Vec<u8>, snapshot_version: SnapshotVersion) -> Self {
        Self {
            resume_token,
            snapshot_version,
            expected_count: None,
            ..self.clone()
        }
    }

    pub fn with_expected_count(&self, expected_count: i32) -> Self {
        Self {
            expected_count: Some(expected_count),
            ..self.clone()
        }
    }

    pub fn with_last_limbo_free_snapshot_version(&self, version: SnapshotVersion) -> Self {
        Self {
            last_limbo_free_snapshot_version: version,
            ..self.clone()
        }
    }

    pub fn with_purpose(&self, purpose: TargetPurpose) -> Self {
        Self {
            purpose,
            ..self.clone()
        }
    }
}
