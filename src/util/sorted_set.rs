use std::cmp::Ordering;
use std::fmt::{self, Debug, Formatter};

use crate::util::sorted_map::{Comparator, SortedMap, SortedMapIter};

/// Immutable sorted set built on [`SortedMap`].
pub struct SortedSet<T> {
    map: SortedMap<T, ()>,
}

impl<T> Clone for SortedSet<T> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<T: Ord + 'static> SortedSet<T> {
    pub fn new() -> Self {
        Self {
            map: SortedMap::new(),
        }
    }
}

impl<T: Ord + 'static> Default for SortedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Ord + Clone + 'static> FromIterator<T> for SortedSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        iter.into_iter()
            .fold(SortedSet::new(), |set, item| set.insert(item))
    }
}

impl<T> SortedSet<T> {
    pub fn with_comparator(comparator: Comparator<T>) -> Self {
        Self {
            map: SortedMap::with_comparator(comparator),
        }
    }

    pub fn comparator(&self) -> &Comparator<T> {
        self.map.comparator()
    }

    pub fn contains(&self, item: &T) -> bool {
        self.map.contains_key(item)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn first(&self) -> Option<&T> {
        self.map.min_key()
    }

    pub fn last(&self) -> Option<&T> {
        self.map.max_key()
    }

    pub fn index_of(&self, item: &T) -> Option<usize> {
        self.map.index_of(item)
    }

    pub fn iter(&self) -> SortedSetIter<'_, T> {
        SortedSetIter {
            inner: self.map.iter(),
        }
    }

    /// Iterates items greater than or equal to `start`.
    pub fn iter_from<'a>(&'a self, start: &T) -> SortedSetIter<'a, T> {
        SortedSetIter {
            inner: self.map.iter_from(start),
        }
    }

    pub fn reverse_iter(&self) -> SortedSetIter<'_, T> {
        SortedSetIter {
            inner: self.map.reverse_iter(),
        }
    }

    /// Iterates items in `[start, end)` under the set's comparator.
    pub fn range<'a>(&'a self, start: &T, end: &'a T) -> impl Iterator<Item = &'a T> + 'a {
        let comparator = self.map.comparator().clone();
        self.iter_from(start)
            .take_while(move |item| comparator(item, end) == Ordering::Less)
    }
}

impl<T: Clone> SortedSet<T> {
    pub fn insert(&self, item: T) -> Self {
        Self {
            map: self.map.insert(item, ()),
        }
    }

    pub fn remove(&self, item: &T) -> Self {
        Self {
            map: self.map.remove(item),
        }
    }

    /// Returns a set holding the items of both sets. The larger set is used as
    /// the base so fewer nodes are copied.
    pub fn union_with(&self, other: &SortedSet<T>) -> Self {
        let (base, extra) = if self.len() >= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        extra
            .iter()
            .fold(base.clone(), |set, item| set.insert(item.clone()))
    }
}

impl<T: PartialEq> PartialEq for SortedSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.len() == other.len() && self.iter().zip(other.iter()).all(|(l, r)| l == r)
    }
}

impl<T: Debug> Debug for SortedSet<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<'a, T> IntoIterator for &'a SortedSet<T> {
    type Item = &'a T;
    type IntoIter = SortedSetIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct SortedSetIter<'a, T> {
    inner: SortedMapIter<'a, T, ()>,
}

impl<'a, T> Iterator for SortedSetIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(item, _)| item)
    }
}
