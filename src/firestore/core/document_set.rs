use std::fmt;
use std::sync::Arc;

use crate::firestore::core::query::DocumentComparator;
use crate::firestore::model::{DocumentKey, MutableDocument};
use crate::util::{SortedMap, SortedSet};

/// Documents ordered by a query comparator (ties broken by key), with a key
/// index for lookups. Persistent: every update returns a new set.
#[derive(Clone)]
pub struct DocumentSet {
    comparator: DocumentComparator,
    keyed: SortedMap<DocumentKey, MutableDocument>,
    sorted: SortedSet<MutableDocument>,
}

impl DocumentSet {
    pub fn new(comparator: DocumentComparator) -> Self {
        let comparator: DocumentComparator = Arc::new(move |left: &MutableDocument, right: &MutableDocument| {
            comparator(left, right).then_with(|| left.key().cmp(right.key()))
        });
        Self {
            sorted: SortedSet::with_comparator(comparator.clone()),
            keyed: SortedMap::new(),
            comparator,
        }
    }

    /// Ordered by key only.
    pub fn by_key() -> Self {
        Self::new(Arc::new(|left: &MutableDocument, right: &MutableDocument| {
            left.key().cmp(right.key())
        }))
    }

    /// An empty set with the same ordering as `self`.
    pub fn empty_like(&self) -> Self {
        Self {
            comparator: self.comparator.clone(),
            keyed: SortedMap::new(),
            sorted: SortedSet::with_comparator(self.comparator.clone()),
        }
    }

    pub fn comparator(&self) -> &DocumentComparator {
        &self.comparator
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.keyed.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&MutableDocument> {
        self.keyed.get(key)
    }

    pub fn first(&self) -> Option<&MutableDocument> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&MutableDocument> {
        self.sorted.last()
    }

    pub fn len(&self) -> usize {
        self.keyed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyed.is_empty()
    }

    /// Position of `key` in query order.
    pub fn index_of(&self, key: &DocumentKey) -> Option<usize> {
        let document = self.keyed.get(key)?;
        self.sorted.index_of(document)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MutableDocument> {
        self.sorted.iter()
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn insert(&self, document: MutableDocument) -> Self {
        let removed = self.remove(document.key());
        Self {
            comparator: removed.comparator.clone(),
            keyed: removed.keyed.insert(document.key().clone(), document.clone()),
            sorted: removed.sorted.insert(document),
        }
    }

    pub fn remove(&self, key: &DocumentKey) -> Self {
        let Some(existing) = self.keyed.get(key) else {
            return self.clone();
        };
        Self {
            comparator: self.comparator.clone(),
            keyed: self.keyed.remove(key),
            sorted: self.sorted.remove(existing),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(MutableDocument::key)
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(left, right)| left == right)
    }
}

impl fmt::Debug for DocumentSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}
