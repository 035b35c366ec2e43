use crate::firestore::core::query::Query;
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, ResourcePath, SnapshotVersion,
};
use crate::util::assert::hard_assert;
use crate::util::SortedMap;

#[derive(Clone, Debug)]
struct CacheEntry {
    document: MutableDocument,
    size: usize,
}

/// The last state of each document the backend confirmed.
#[derive(Clone, Debug, Default)]
pub struct MemoryRemoteDocumentCache {
    docs: SortedMap<DocumentKey, CacheEntry>,
    size: usize,
}

impl MemoryRemoteDocumentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `document`, replacing any cached version. The document must
    /// carry the read time it was received at.
    pub fn add_entry(&mut self, document: MutableDocument) {
        hard_assert(
            !document.read_time().is_min(),
            0xa8a2,
            "cannot add a document with a read time of zero",
        );
        let key = document.key().clone();
        let size = document_size(&document);
        if let Some(previous) = self.docs.get(&key) {
            self.size -= previous.size;
        }
        self.size += size;
        self.docs = self.docs.insert(key, CacheEntry { document, size });
    }

    pub fn remove_entry(&mut self, key: &DocumentKey) {
        if let Some(previous) = self.docs.get(key) {
            self.size -= previous.size;
            self.docs = self.docs.remove(key);
        }
    }

    /// The cached document, or an invalid document when nothing is cached.
    pub fn get_entry(&self, key: &DocumentKey) -> MutableDocument {
        match self.docs.get(key) {
            Some(entry) => entry.document.clone(),
            None => MutableDocument::new_invalid_document(key.clone()),
        }
    }

    pub fn get_entries<'a, I>(&self, keys: I) -> DocumentMap
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter().fold(DocumentMap::new(), |map, key| {
            map.insert(key.clone(), self.get_entry(key))
        })
    }

    /// Documents directly inside the query's collection that were read after
    /// `since_read_time` and either match the query or have local mutations
    /// (`mutated_keys`) that may make them match.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
        mutated_keys: &DocumentKeySet,
    ) -> DocumentMap {
        let collection = query.path();
        let mut results = DocumentMap::new();
        let Ok(start) = DocumentKey::first_in_collection(collection) else {
            return results;
        };
        for (key, entry) in self.docs.iter_from(&start) {
            if !collection.is_prefix_of(key.path()) {
                break;
            }
            if key.path().len() > collection.len() + 1 {
                continue;
            }
            if entry.document.read_time() <= since_read_time {
                continue;
            }
            if !mutated_keys.contains(key) && !query.matches(&entry.document) {
                continue;
            }
            results = results.insert(key.clone(), entry.document.clone());
        }
        results
    }

    /// Documents in any collection named `collection_group` read after
    /// `since_read_time`, at most `limit` of them in key order.
    pub fn get_all_from_collection_group(
        &self,
        collection_group: &str,
        since_read_time: SnapshotVersion,
        limit: usize,
    ) -> DocumentMap {
        self.docs
            .iter()
            .filter(|(key, entry)| {
                key.has_collection_id(collection_group) && entry.document.read_time() > since_read_time
            })
            .take(limit)
            .fold(DocumentMap::new(), |map, (key, entry)| {
                map.insert(key.clone(), entry.document.clone())
            })
    }

    /// Keys of every cached document directly inside `collection`.
    pub fn keys_in_collection(&self, collection: &ResourcePath) -> Vec<DocumentKey> {
        let Ok(start) = DocumentKey::first_in_collection(collection) else {
            return Vec::new();
        };
        self.docs
            .iter_from(&start)
            .map(|(key, _)| key)
            .take_while(|key| collection.is_prefix_of(key.path()))
            .filter(|key| key.path().len() == collection.len() + 1)
            .cloned()
            .collect()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.docs.keys()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Approximate byte size of all cached documents.
    pub fn size(&self) -> usize {
        self.size
    }
}

fn document_size(document: &MutableDocument) -> usize {
    document.key().path().canonical_string().len() + document.data().estimate_byte_size()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::filter::{FieldFilter, FilterOperator};
    use crate::firestore::model::{FieldPath, ObjectValue, Timestamp};
    use crate::firestore::value::FirestoreValue;

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn doc(path: &str, n: i64, read_at: i64) -> MutableDocument {
        let mut data = ObjectValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(n));
        let mut doc = MutableDocument::new_found_document(DocumentKey::from_string(path).unwrap(), version(1), data);
        doc.set_read_time(version(read_at));
        doc
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn missing_entries_are_invalid_documents() {
        let cache = MemoryRemoteDocumentCache::new();
        assert!(!cache.get_entry(&key("c/a")).is_valid_document());
    }

    #[test]
    fn tracks_size_across_replacements() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("c/a", 1, 1));
        let first = cache.size();
        cache.add_entry(doc("c/a", 2, 2));
        assert_eq!(cache.size(), first);
        cache.remove_entry(&key("c/a"));
        assert_eq!(cache.size(), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn query_scan_skips_nested_and_old_documents() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("c/a", 1, 1));
        cache.add_entry(doc("c/b", 5, 3));
        cache.add_entry(doc("c/b/sub/x", 5, 3));
        cache.add_entry(doc("d/a", 5, 3));
        cache.add_entry(doc("c/__id7__", 9, 3));

        let query = Query::new(ResourcePath::from_string("c").unwrap());
        let all = cache.get_documents_matching_query(&query, SnapshotVersion::min(), &DocumentKeySet::new());
        let keys: Vec<String> = all.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys.len(), 3);
        assert!(keys.iter().all(|k| k.starts_with("c/")));

        let recent = cache.get_documents_matching_query(&query, version(2), &DocumentKeySet::new());
        assert_eq!(recent.len(), 2);

        let filtered = query.with_filter(FieldFilter::new(
            FieldPath::from_dot_separated("n").unwrap(),
            FilterOperator::GreaterThan,
            FirestoreValue::from_integer(6),
        ));
        let mutated = DocumentKeySet::new().insert(key("c/a"));
        let matching = cache.get_documents_matching_query(&filtered, SnapshotVersion::min(), &mutated);
        assert!(matching.contains_key(&key("c/a")));
        assert!(matching.contains_key(&key("c/__id7__")));
        assert!(!matching.contains_key(&key("c/b")));
    }

    #[test]
    fn collection_group_scan_respects_limit() {
        let mut cache = MemoryRemoteDocumentCache::new();
        cache.add_entry(doc("a/1/msgs/x", 1, 1));
        cache.add_entry(doc("b/2/msgs/y", 1, 1));
        cache.add_entry(doc("msgs/z", 1, 1));
        assert_eq!(cache.get_all_from_collection_group("msgs", SnapshotVersion::min(), 10).len(), 3);
        assert_eq!(cache.get_all_from_collection_group("msgs", SnapshotVersion::min(), 2).len(), 2);
        assert_eq!(cache.keys_in_collection(&ResourcePath::from_string("msgs").unwrap()).len(), 1);
    }
}
