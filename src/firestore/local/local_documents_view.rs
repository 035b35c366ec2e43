use std::collections::BTreeMap;

use crate::firestore::core::query::Query;
use crate::firestore::local::document_overlay_cache::MemoryDocumentOverlayCache;
use crate::firestore::local::index_manager::MemoryIndexManager;
use crate::firestore::local::mutation_queue::MemoryMutationQueue;
use crate::firestore::local::remote_document_cache::MemoryRemoteDocumentCache;
use crate::firestore::model::{
    calculate_overlay_mutation, DocumentKey, DocumentKeySet, DocumentMap, FieldMask, MutableDocument, Mutation,
    Overlay, OverlayedDocument, ResourcePath, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};

/// Documents keyed by key that can be updated in place.
pub type MutableDocumentMap = BTreeMap<DocumentKey, MutableDocument>;

/// Combines the remote document cache with the overlays of pending
/// mutations to produce what the user should see.
pub struct LocalDocumentsView<'a> {
    remote_documents: &'a MemoryRemoteDocumentCache,
    mutation_queue: &'a MemoryMutationQueue,
    overlays: &'a mut MemoryDocumentOverlayCache,
    index_manager: &'a MemoryIndexManager,
}

impl<'a> LocalDocumentsView<'a> {
    pub fn new(
        remote_documents: &'a MemoryRemoteDocumentCache,
        mutation_queue: &'a MemoryMutationQueue,
        overlays: &'a mut MemoryDocumentOverlayCache,
        index_manager: &'a MemoryIndexManager,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlays,
            index_manager,
        }
    }

    /// The local view of one document. Missing documents come back invalid.
    pub fn get_document(&self, key: &DocumentKey) -> MutableDocument {
        let overlay = self.overlays.get_overlay(key);
        let mut document = self.base_document(key, overlay);
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        document
    }

    pub fn get_documents<'k, I>(&mut self, keys: I) -> DocumentMap
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let documents = self.remote_documents.get_entries(keys);
        self.get_local_view_of_documents(to_mutable_map(&documents), &DocumentKeySet::new())
    }

    /// Applies overlays to `documents`. Keys in `existence_state_changed`
    /// flipped between existing and missing remotely, so their overlays are
    /// recomputed from the mutation queue first.
    pub fn get_local_view_of_documents(
        &mut self,
        documents: MutableDocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> DocumentMap {
        let overlays = self.overlays.get_overlays(documents.keys());
        self.compute_views(documents, overlays, existence_state_changed)
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect()
    }

    /// Like [`Self::get_local_view_of_documents`], keeping the mask of
    /// fields each overlay touched.
    pub fn get_overlayed_documents(&mut self, documents: MutableDocumentMap) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let overlays = self.overlays.get_overlays(documents.keys());
        self.compute_views(documents, overlays, &DocumentKeySet::new())
    }

    /// Replays every queued batch touching `documents` onto them, in batch
    /// order, and stores the resulting overlays. Returns the mutated field
    /// mask per key.
    pub fn recalculate_and_save_overlays(
        &mut self,
        documents: &mut MutableDocumentMap,
    ) -> BTreeMap<DocumentKey, Option<FieldMask>> {
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut documents_by_batch_id: BTreeMap<i32, Vec<DocumentKey>> = BTreeMap::new();

        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(documents.keys());
        for batch in &batches {
            for key in batch.keys().iter() {
                let Some(base) = documents.get_mut(key) else {
                    continue;
                };
                let mask = masks.remove(key).unwrap_or_else(|| Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(base, mask);
                masks.insert(key.clone(), mask);
                documents_by_batch_id
                    .entry(batch.batch_id)
                    .or_default()
                    .push(key.clone());
            }
        }

        // The newest batch touching a key owns its overlay.
        let mut processed = DocumentKeySet::new();
        for (batch_id, keys) in documents_by_batch_id.into_iter().rev() {
            let mut overlays: BTreeMap<DocumentKey, Mutation> = BTreeMap::new();
            for key in keys {
                if processed.contains(&key) {
                    continue;
                }
                if let Some(document) = documents.get(&key) {
                    let mask = masks.get(&key).cloned().flatten();
                    if let Some(mutation) = calculate_overlay_mutation(document, mask.as_ref()) {
                        overlays.insert(key.clone(), mutation);
                    }
                }
                processed = processed.insert(key);
            }
            self.overlays.save_overlays(batch_id, overlays);
        }
        masks
    }

    pub fn recalculate_and_save_overlays_for_document_keys<'k, I>(&mut self, keys: I)
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let documents = self.remote_documents.get_entries(keys);
        let mut documents = to_mutable_map(&documents);
        self.recalculate_and_save_overlays(&mut documents);
    }

    /// Local view of every document matching `query` whose remote copy was
    /// read after `since_read_time`, plus every document with an overlay.
    pub fn get_documents_matching_query(&self, query: &Query, since_read_time: SnapshotVersion) -> DocumentMap {
        if query.is_document_query() {
            self.get_documents_matching_document_query(query.path())
        } else if let Some(collection_id) = query.collection_group_id() {
            self.get_documents_matching_collection_group_query(query, collection_id, since_read_time)
        } else {
            self.get_documents_matching_collection_query(query, since_read_time)
        }
    }

    fn get_documents_matching_document_query(&self, path: &ResourcePath) -> DocumentMap {
        let Ok(key) = DocumentKey::from_path(path.clone()) else {
            return DocumentMap::new();
        };
        let document = self.get_document(&key);
        if document.is_found_document() {
            DocumentMap::new().insert(key, document)
        } else {
            DocumentMap::new()
        }
    }

    fn get_documents_matching_collection_group_query(
        &self,
        query: &Query,
        collection_id: &str,
        since_read_time: SnapshotVersion,
    ) -> DocumentMap {
        let mut results = DocumentMap::new();
        for parent in self.index_manager.get_collection_parents(collection_id) {
            let collection_query = query.as_collection_query_at_path(parent.child([collection_id]));
            for (key, document) in self
                .get_documents_matching_collection_query(&collection_query, since_read_time)
                .iter()
            {
                results = results.insert(key.clone(), document.clone());
            }
        }
        results
    }

    fn get_documents_matching_collection_query(&self, query: &Query, since_read_time: SnapshotVersion) -> DocumentMap {
        let overlays = self
            .overlays
            .get_overlays_for_collection(query.path(), BATCH_ID_UNKNOWN);
        let overlay_keys: DocumentKeySet = overlays.keys().cloned().collect();
        let mut remote = to_mutable_map(&self.remote_documents.get_documents_matching_query(
            query,
            since_read_time,
            &overlay_keys,
        ));
        // Documents may match only because of their overlay.
        for key in overlays.keys() {
            remote
                .entry(key.clone())
                .or_insert_with(|| MutableDocument::new_invalid_document(key.clone()));
        }

        let mut results = DocumentMap::new();
        for (key, mut document) in remote {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
            }
            if query.matches(&document) {
                results = results.insert(key, document);
            }
        }
        results
    }

    fn compute_views(
        &mut self,
        mut documents: MutableDocumentMap,
        overlays: BTreeMap<DocumentKey, Overlay>,
        existence_state_changed: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let mut recalculate = MutableDocumentMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            let is_patch = overlay.is_some_and(|overlay| matches!(overlay.mutation, Mutation::Patch { .. }));
            if existence_state_changed.contains(key) && (overlay.is_none() || is_patch) {
                recalculate.insert(key.clone(), document.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.extract_field_mask();
                mutated_fields.insert(key.clone(), mask.clone());
                overlay.mutation.apply_to_local_view(document, mask, Timestamp::now());
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            }
        }

        mutated_fields.extend(self.recalculate_and_save_overlays(&mut recalculate));
        documents.extend(recalculate);

        documents
            .into_iter()
            .map(|(key, document)| {
                let fields = mutated_fields.remove(&key).flatten();
                (key, OverlayedDocument::new(document, fields))
            })
            .collect()
    }

    fn base_document(&self, key: &DocumentKey, overlay: Option<&Overlay>) -> MutableDocument {
        match overlay {
            Some(overlay) if !matches!(overlay.mutation, Mutation::Patch { .. }) => {
                MutableDocument::new_invalid_document(key.clone())
            }
            _ => self.remote_documents.get_entry(key),
        }
    }
}

pub(crate) fn to_mutable_map(documents: &DocumentMap) -> MutableDocumentMap {
    documents
        .iter()
        .map(|(key, document)| (key.clone(), document.clone()))
        .collect()
}
