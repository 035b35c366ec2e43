use crate::firestore::model::{DocumentKey, FieldMask, MutableDocument, Mutation};

/// Net effect of every pending batch touching a document.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    /// Id of the newest batch folded into `mutation`.
    pub largest_batch_id: i32,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: i32, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

/// A document with local mutations applied, plus the fields those mutations
/// touched (`None` when the whole document was replaced).
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: MutableDocument,
    pub mutated_fields: Option<FieldMask>,
}

impl OverlayedDocument {
    pub fn new(document: MutableDocument, mutated_fields: Option<FieldMask>) -> Self {
        Self {
            document,
            mutated_fields,
        }
    }
}
