use std::cmp::Ordering;
use std::sync::Arc;

use crate::firestore::model::{DocumentKey, DocumentKeySet};
use crate::util::SortedSet;

/// A reference from a target or mutation batch to a document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocReference {
    pub key: DocumentKey,
    pub target_or_batch_id: i32,
}

impl DocReference {
    pub fn new(key: DocumentKey, target_or_batch_id: i32) -> Self {
        Self { key, target_or_batch_id }
    }

    fn by_id(left: &Self, right: &Self) -> Ordering {
        left.target_or_batch_id
            .cmp(&right.target_or_batch_id)
            .then_with(|| left.key.cmp(&right.key))
    }
}

/// Ordered by key, then by id.
impl Ord for DocReference {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.target_or_batch_id.cmp(&other.target_or_batch_id))
    }
}

impl PartialOrd for DocReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Two-way index of references between documents and the targets or
/// batches holding them.
#[derive(Clone, Debug)]
pub struct ReferenceSet {
    refs_by_key: SortedSet<DocReference>,
    refs_by_id: SortedSet<DocReference>,
}

impl Default for ReferenceSet {
    fn default() -> Self {
        Self {
            refs_by_key: SortedSet::new(),
            refs_by_id: SortedSet::with_comparator(Arc::new(DocReference::by_id)),
        }
    }
}

impl ReferenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.refs_by_key.is_empty()
    }

    pub fn add_reference(&mut self, key: DocumentKey, id: i32) {
        let reference = DocReference::new(key, id);
        self.refs_by_key = self.refs_by_key.insert(reference.clone());
        self.refs_by_id = self.refs_by_id.insert(reference);
    }

    pub fn add_references<'a, I>(&mut self, keys: I, id: i32)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.add_reference(key.clone(), id);
        }
    }

    pub fn remove_reference(&mut self, key: DocumentKey, id: i32) {
        self.remove(&DocReference::new(key, id));
    }

    pub fn remove_references<'a, I>(&mut self, keys: I, id: i32)
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        for key in keys {
            self.remove_reference(key.clone(), id);
        }
    }

    /// Drops every reference held by `id` and returns the affected keys.
    pub fn remove_references_for_id(&mut self, id: i32) -> Vec<DocumentKey> {
        let references = self.references_with_id(id);
        for reference in &references {
            self.remove(reference);
        }
        references.into_iter().map(|reference| reference.key).collect()
    }

    pub fn remove_all_references(&mut self) -> Vec<DocumentKey> {
        let keys = self.refs_by_key.iter().map(|reference| reference.key.clone()).collect();
        *self = Self::new();
        keys
    }

    pub fn references_for_id(&self, id: i32) -> DocumentKeySet {
        self.references_with_id(id)
            .into_iter()
            .map(|reference| reference.key)
            .collect()
    }

    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        let start = DocReference::new(key.clone(), i32::MIN);
        self.refs_by_key
            .iter_from(&start)
            .next()
            .is_some_and(|reference| &reference.key == key)
    }

    fn references_with_id(&self, id: i32) -> Vec<DocReference> {
        let start = DocReference::new(DocumentKey::min_key(), id);
        self.refs_by_id
            .iter_from(&start)
            .take_while(|reference| reference.target_or_batch_id == id)
            .cloned()
            .collect()
    }

    fn remove(&mut self, reference: &DocReference) {
        self.refs_by_key = self.refs_by_key.remove(reference);
        self.refs_by_id = self.refs_by_id.remove(reference);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn tracks_references_both_ways() {
        let mut refs = ReferenceSet::new();
        refs.add_reference(key("c/a"), 1);
        refs.add_reference(key("c/b"), 1);
        refs.add_reference(key("c/a"), 2);

        assert_eq!(refs.references_for_id(1).len(), 2);
        assert!(refs.contains_key(&key("c/a")));

        refs.remove_reference(key("c/a"), 1);
        assert!(refs.contains_key(&key("c/a")));
        refs.remove_reference(key("c/a"), 2);
        assert!(!refs.contains_key(&key("c/a")));
        assert!(refs.contains_key(&key("c/b")));
    }

    #[test]
    fn removes_all_references_for_id() {
        let mut refs = ReferenceSet::new();
        refs.add_references([key("c/a"), key("c/b")].iter(), 3);
        refs.add_reference(key("c/c"), 4);
        let removed = refs.remove_references_for_id(3);
        assert_eq!(removed, vec![key("c/a"), key("c/b")]);
        assert!(refs.references_for_id(3).is_empty());
        assert_eq!(refs.references_for_id(4).len(), 1);
        assert_eq!(refs.remove_all_references(), vec![key("c/c")]);
        assert!(refs.is_empty());
    }
}
