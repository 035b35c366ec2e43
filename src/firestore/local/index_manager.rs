use std::collections::{BTreeSet, HashMap};

use crate::firestore::model::ResourcePath;
use crate::util::assert::hard_assert;

/// Remembers every parent path under which a collection id has been seen,
/// so collection group queries can be expanded into collection queries.
#[derive(Clone, Debug, Default)]
pub struct MemoryIndexManager {
    collection_parents: HashMap<String, BTreeSet<ResourcePath>>,
}

impl MemoryIndexManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `collection_path`. Returns whether it was new.
    pub fn add_to_collection_parent_index(&mut self, collection_path: &ResourcePath) -> bool {
        hard_assert(
            collection_path.len() % 2 == 1,
            0x6fde,
            format!("expected a collection path, got {collection_path}"),
        );
        let Some(collection_id) = collection_path.last_segment() else {
            return false;
        };
        self.collection_parents
            .entry(collection_id.to_string())
            .or_default()
            .insert(collection_path.without_last())
    }

    /// Parent paths of every known collection named `collection_id`.
    pub fn get_collection_parents(&self, collection_id: &str) -> Vec<ResourcePath> {
        self.collection_parents
            .get(collection_id)
            .map(|parents| parents.iter().cloned().collect())
            .unwrap_or_default()
    }
}
