use crate::firestore::model::{DocumentKey, FieldPath, ObjectValue, SnapshotVersion};
use crate::firestore::value::FirestoreValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentType {
    /// Placeholder for a key the cache knows nothing about.
    Invalid,
    FoundDocument,
    /// The document is known not to exist at `version`.
    NoDocument,
    /// The document was written but its contents are unknown (e.g. a patch
    /// was acknowledged for a document we never saw).
    UnknownDocument,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentState {
    Synced,
    HasLocalMutations,
    HasCommittedMutations,
}

/// A document as held by the caches and views. Conversions mutate in place
/// and return `&mut Self` so they can be chained.
#[derive(Clone, Debug, PartialEq)]
pub struct MutableDocument {
    key: DocumentKey,
    document_type: DocumentType,
    version: SnapshotVersion,
    read_time: SnapshotVersion,
    create_time: SnapshotVersion,
    data: ObjectValue,
    document_state: DocumentState,
}

/// Read-only view used where documents leave the local store.
pub type Document = MutableDocument;

impl MutableDocument {
    fn with_type(
        key: DocumentKey,
        document_type: DocumentType,
        version: SnapshotVersion,
        data: ObjectValue,
        document_state: DocumentState,
    ) -> Self {
        Self {
            key,
            document_type,
            version,
            read_time: SnapshotVersion::min(),
            create_time: SnapshotVersion::min(),
            data,
            document_state,
        }
    }

    pub fn new_invalid_document(key: DocumentKey) -> Self {
        Self::with_type(
            key,
            DocumentType::Invalid,
            SnapshotVersion::min(),
            ObjectValue::empty(),
            DocumentState::Synced,
        )
    }

    pub fn new_found_document(key: DocumentKey, version: SnapshotVersion, data: ObjectValue) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_found_document(version, data);
        document
    }

    pub fn new_no_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_no_document(version);
        document
    }

    pub fn new_unknown_document(key: DocumentKey, version: SnapshotVersion) -> Self {
        let mut document = Self::new_invalid_document(key);
        document.convert_to_unknown_document(version);
        document
    }

    pub fn convert_to_found_document(&mut self, version: SnapshotVersion, data: ObjectValue) -> &mut Self {
        if self.create_time.is_min()
            && matches!(self.document_type, DocumentType::NoDocument | DocumentType::Invalid)
        {
            self.create_time = version;
        }
        self.version = version;
        self.document_type = DocumentType::FoundDocument;
        self.data = data;
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_no_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::NoDocument;
        self.data = ObjectValue::empty();
        self.document_state = DocumentState::Synced;
        self
    }

    pub fn convert_to_unknown_document(&mut self, version: SnapshotVersion) -> &mut Self {
        self.version = version;
        self.document_type = DocumentType::UnknownDocument;
        self.data = ObjectValue::empty();
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    pub fn set_has_committed_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasCommittedMutations;
        self
    }

    /// Marks the document as locally modified. Local writes have no remote
    /// version, so the version is reset.
    pub fn set_has_local_mutations(&mut self) -> &mut Self {
        self.document_state = DocumentState::HasLocalMutations;
        self.version = SnapshotVersion::min();
        self
    }

    pub fn set_read_time(&mut self, read_time: SnapshotVersion) -> &mut Self {
        self.read_time = read_time;
        self
    }

    pub fn set_create_time(&mut self, create_time: SnapshotVersion) -> &mut Self {
        self.create_time = create_time;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn document_type(&self) -> DocumentType {
        self.document_type
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn read_time(&self) -> SnapshotVersion {
        self.read_time
    }

    pub fn create_time(&self) -> SnapshotVersion {
        self.create_time
    }

    pub fn data(&self) -> &ObjectValue {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut ObjectValue {
        &mut self.data
    }

    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        self.data.field(path)
    }

    pub fn has_local_mutations(&self) -> bool {
        self.document_state == DocumentState::HasLocalMutations
    }

    pub fn has_committed_mutations(&self) -> bool {
        self.document_state == DocumentState::HasCommittedMutations
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_local_mutations() || self.has_committed_mutations()
    }

    pub fn is_valid_document(&self) -> bool {
        self.document_type != DocumentType::Invalid
    }

    pub fn is_found_document(&self) -> bool {
        self.document_type == DocumentType::FoundDocument
    }

    pub fn is_no_document(&self) -> bool {
        self.document_type == DocumentType::NoDocument
    }

    pub fn is_unknown_document(&self) -> bool {
        self.document_type == DocumentType::UnknownDocument
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::Timestamp;

    fn key() -> DocumentKey {
        DocumentKey::from_string("rooms/eros").unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    #[test]
    fn found_document_records_create_time() {
        let mut doc = MutableDocument::new_no_document(key(), version(1));
        doc.convert_to_found_document(version(5), ObjectValue::empty());
        assert!(doc.is_found_document());
        assert_eq!(doc.create_time(), version(5));
        doc.convert_to_found_document(version(9), ObjectValue::empty());
        assert_eq!(doc.create_time(), version(5));
    }

    #[test]
    fn local_mutations_reset_version() {
        let mut doc = MutableDocument::new_found_document(key(), version(3), ObjectValue::empty());
        doc.set_has_local_mutations();
        assert!(doc.has_pending_writes());
        assert!(doc.version().is_min());
    }

    #[test]
    fn unknown_document_has_committed_mutations() {
        let doc = MutableDocument::new_unknown_document(key(), version(2));
        assert!(doc.is_unknown_document());
        assert!(doc.has_committed_mutations());
        assert!(!MutableDocument::new_invalid_document(key()).is_valid_document());
    }
}
