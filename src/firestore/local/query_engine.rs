use crate::firestore::core::document_set::DocumentSet;
use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::model::{DocumentKeySet, DocumentMap, SnapshotVersion};

/// Runs queries against the local documents view.
///
/// When a query was last known to be limbo-free, the documents it matched
/// at that point are reused and only documents updated since then are
/// scanned. Otherwise every document in the collection is read.
#[derive(Clone, Copy, Debug, Default)]
pub struct QueryEngine;

impl QueryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn get_documents_matching_query(
        &self,
        local_documents: &mut LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> DocumentMap {
        if let Some(results) =
            self.perform_query_using_remote_keys(local_documents, query, last_limbo_free_snapshot_version, remote_keys)
        {
            return results;
        }
        self.execute_full_collection_scan(local_documents, query)
    }

    fn perform_query_using_remote_keys(
        &self,
        local_documents: &mut LocalDocumentsView<'_>,
        query: &Query,
        last_limbo_free_snapshot_version: SnapshotVersion,
        remote_keys: &DocumentKeySet,
    ) -> Option<DocumentMap> {
        // Nothing to gain when every document has to be read anyway.
        if query.matches_all_documents() || last_limbo_free_snapshot_version == SnapshotVersion::min() {
            return None;
        }

        let documents = local_documents.get_documents(remote_keys.iter());
        let previous_results = apply_query(query, &documents);

        if query.has_limit()
            && needs_refill(query, &previous_results, remote_keys, last_limbo_free_snapshot_version)
        {
            return None;
        }

        log::debug!(
            "re-using previous result from {last_limbo_free_snapshot_version} to execute query: {}",
            query.canonical_id()
        );

        let mut results = local_documents.get_documents_matching_query(query, last_limbo_free_snapshot_version);
        // Previous results win over nothing, but updates read since then win
        // over previous results.
        for document in previous_results.iter() {
            if !results.contains_key(document.key()) {
                results = results.insert(document.key().clone(), document.clone());
            }
        }
        Some(results)
    }

    fn execute_full_collection_scan(&self, local_documents: &LocalDocumentsView<'_>, query: &Query) -> DocumentMap {
        log::debug!("using full collection scan to execute query: {}", query.canonical_id());
        local_documents.get_documents_matching_query(query, SnapshotVersion::min())
    }
}

fn apply_query(query: &Query, documents: &DocumentMap) -> DocumentSet {
    documents
        .values()
        .filter(|document| query.matches(document))
        .fold(DocumentSet::new(query.comparator()), |set, document| {
            set.insert(document.clone())
        })
}

/// Whether a limited query may have lost documents at its edge, which means
/// the cached result cannot be trusted.
fn needs_refill(
    query: &Query,
    sorted_previous_results: &DocumentSet,
    remote_keys: &DocumentKeySet,
    limbo_free_snapshot_version: SnapshotVersion,
) -> bool {
    // A remote document that no longer matches left a gap.
    if remote_keys.len() != sorted_previous_results.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous_results.last(),
        LimitType::Last => sorted_previous_results.first(),
    };
    let Some(edge) = edge else {
        return false;
    };
    edge.has_pending_writes() || edge.version() > limbo_free_snapshot_version
}
