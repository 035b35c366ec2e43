use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::firestore::model::{DocumentKey, Mutation, Overlay, ResourcePath};
use crate::util::SortedMap;

/// One overlay per document, indexed by the batch that last wrote it.
#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentOverlayCache {
    overlays: SortedMap<DocumentKey, Overlay>,
    overlay_by_batch_id: HashMap<i32, BTreeSet<DocumentKey>>,
}

impl MemoryDocumentOverlayCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_overlay(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    /// Overlays for the subset of `keys` that have one.
    pub fn get_overlays<'a, I>(&self, keys: I) -> BTreeMap<DocumentKey, Overlay>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .filter_map(|key| self.overlays.get(key).map(|overlay| (key.clone(), overlay.clone())))
            .collect()
    }

    pub fn save_overlays(&mut self, largest_batch_id: i32, overlays: BTreeMap<DocumentKey, Mutation>) {
        for mutation in overlays.into_values() {
            self.save_overlay(largest_batch_id, mutation);
        }
    }

    /// Drops the overlays last written by `batch_id`.
    pub fn remove_overlays_for_batch_id(&mut self, batch_id: i32) {
        if let Some(keys) = self.overlay_by_batch_id.remove(&batch_id) {
            for key in keys {
                self.overlays = self.overlays.remove(&key);
            }
        }
    }

    /// Overlays of documents directly inside `collection` written by batches
    /// after `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: i32,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let Ok(start) = DocumentKey::first_in_collection(collection) else {
            return BTreeMap::new();
        };
        self.overlays
            .iter_from(&start)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, overlay)| {
                key.path().len() == collection.len() + 1 && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    /// Overlays in collections named `collection_group`, grouped by batch.
    /// Whole batches are returned, so the result may exceed `count`.
    pub fn get_overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: i32,
        count: usize,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let mut by_batch: BTreeMap<i32, Vec<&Overlay>> = BTreeMap::new();
        for (key, overlay) in self.overlays.iter() {
            if key.has_collection_id(collection_group) && overlay.largest_batch_id > since_batch_id {
                by_batch.entry(overlay.largest_batch_id).or_default().push(overlay);
            }
        }
        let mut result = BTreeMap::new();
        for overlays in by_batch.into_values() {
            for overlay in overlays {
                result.insert(overlay.key().clone(), overlay.clone());
            }
            if result.len() >= count {
                break;
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    fn save_overlay(&mut self, largest_batch_id: i32, mutation: Mutation) {
        let key = mutation.key().clone();
        if let Some(existing) = self.overlays.get(&key) {
            if let Some(keys) = self.overlay_by_batch_id.get_mut(&existing.largest_batch_id) {
                keys.remove(&key);
            }
        }
        self.overlay_by_batch_id
            .entry(largest_batch_id)
            .or_default()
            .insert(key.clone());
        self.overlays = self.overlays.insert(key, Overlay::new(largest_batch_id, mutation));
    }
}
