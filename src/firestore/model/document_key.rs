use std::cmp::Ordering;
use std::fmt::{Display, Formatter};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::ResourcePath;

/// Path to a single document. Always has an even, non-zero number of segments.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    path: ResourcePath,
}

impl DocumentKey {
    pub fn from_path(path: ResourcePath) -> FirestoreResult<Self> {
        if !path.is_document_path() {
            return Err(invalid_argument(format!(
                "Invalid document reference. Document references must have an even number of segments, but {path} has {}",
                path.len()
            )));
        }
        Ok(Self { path })
    }

    pub fn from_string(path: &str) -> FirestoreResult<Self> {
        Self::from_path(ResourcePath::from_string(path)?)
    }

    pub fn from_segments<I, S>(segments: I) -> FirestoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_path(ResourcePath::from_segments(segments))
    }

    /// A key that sorts before every other key.
    pub fn min_key() -> Self {
        Self {
            path: ResourcePath::from_segments([min_segment(), min_segment()]),
        }
    }

    /// The smallest key that can exist directly inside `collection`.
    pub fn first_in_collection(collection: &ResourcePath) -> FirestoreResult<Self> {
        Self::from_path(collection.child([min_segment()]))
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_path(&self) -> ResourcePath {
        self.path.without_last()
    }

    /// Id of the collection that directly contains the document.
    pub fn collection_group(&self) -> &str {
        self.path.segment(self.path.len() - 2).unwrap_or_default()
    }

    pub fn has_collection_id(&self, collection_id: &str) -> bool {
        self.collection_group() == collection_id
    }

    pub fn id(&self) -> &str {
        self.path.last_segment().unwrap_or_default()
    }

    pub fn comparator(left: &Self, right: &Self) -> Ordering {
        ResourcePath::comparator(&left.path, &right.path)
    }
}

/// Numeric ids sort before all other segments, so the smallest one sorts first.
fn min_segment() -> String {
    format!("__id{}__", i64::MIN)
}

impl PartialOrd for DocumentKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DocumentKey {
    fn cmp(&self, other: &Self) -> Ordering {
        Self::comparator(self, other)
    }
}

impl Display for DocumentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path)
    }
}
