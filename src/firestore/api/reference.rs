use std::fmt::{Display, Formatter};

use rand::{thread_rng, Rng};

use crate::firestore::constants::{AUTO_ID_ALPHABET, AUTO_ID_LENGTH};
use crate::firestore::core;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{DocumentKey, ResourcePath};

use super::database::Firestore;
use super::query::Query;

#[derive(Clone, Debug)]
pub struct CollectionReference {
    firestore: Firestore,
    path: ResourcePath,
}

impl CollectionReference {
    pub(crate) fn new(firestore: Firestore, path: ResourcePath) -> FirestoreResult<Self> {
        if path.len() % 2 == 0 {
            return Err(invalid_argument(format!(
                "Invalid collection reference. Collection references must have an odd number of segments, but {path} has {}",
                path.len()
            )));
        }
        Ok(Self { firestore, path })
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    /// The full resource path of the collection (e.g. `rooms/eros/messages`).
    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    /// Returns the document that contains this collection, if any.
    pub fn parent(&self) -> Option<DocumentReference> {
        let parent_path = self.path.parent()?;
        if parent_path.is_empty() {
            return None;
        }
        DocumentReference::new(self.firestore.clone(), parent_path).ok()
    }

    /// Returns a reference to the document identified by `document_id`, or to
    /// a new document with a random id when `None`.
    pub fn doc(&self, document_id: Option<&str>) -> FirestoreResult<DocumentReference> {
        let id = match document_id {
            Some(id) => {
                if id.is_empty() {
                    return Err(invalid_argument("Document id must be a non-empty string"));
                }
                id.to_string()
            }
            None => generate_auto_id(),
        };
        let path = self.path.child(id.split('/'));
        DocumentReference::new(self.firestore.clone(), path)
    }

    /// A query matching every document in this collection.
    pub fn query(&self) -> Query {
        Query::from_core(self.firestore.clone(), core::Query::new(self.path.clone()))
    }
}

impl Display for CollectionReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CollectionReference({})", self.path.canonical_string())
    }
}

#[derive(Clone, Debug)]
pub struct DocumentReference {
    firestore: Firestore,
    key: DocumentKey,
}

impl DocumentReference {
    pub(crate) fn new(firestore: Firestore, path: ResourcePath) -> FirestoreResult<Self> {
        let key = DocumentKey::from_path(path)?;
        Ok(Self { firestore, key })
    }

    pub(crate) fn from_key(firestore: Firestore, key: DocumentKey) -> Self {
        Self { firestore, key }
    }

    pub fn firestore(&self) -> &Firestore {
        &self.firestore
    }

    pub fn id(&self) -> &str {
        self.key.id()
    }

    pub fn path(&self) -> &ResourcePath {
        self.key.path()
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    /// The collection containing this document.
    pub fn parent(&self) -> CollectionReference {
        CollectionReference {
            firestore: self.firestore.clone(),
            path: self.key.collection_path(),
        }
    }

    /// Returns a reference to a subcollection rooted at this document.
    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        let relative = ResourcePath::from_string(path)?;
        CollectionReference::new(self.firestore.clone(), self.key.path().child_path(&relative))
    }

    pub(crate) fn as_query(&self) -> core::Query {
        core::Query::for_document(&self.key)
    }
}

impl Display for DocumentReference {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "DocumentReference({})", self.key.path().canonical_string())
    }
}

impl PartialEq for DocumentReference {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.firestore.database_id() == other.firestore.database_id()
    }
}

/// A random alphanumeric document id.
pub(crate) fn generate_auto_id() -> String {
    let mut rng = thread_rng();
    (0..AUTO_ID_LENGTH)
        .map(|_| AUTO_ID_ALPHABET[rng.gen_range(0..AUTO_ID_ALPHABET.len())] as char)
        .collect()
}
