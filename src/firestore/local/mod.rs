mod document_overlay_cache;
mod index_manager;
pub mod local_documents_view;
mod local_store;
pub mod lru_garbage_collector;
mod lru_scheduler;
mod mutation_queue;
pub mod persistence;
mod query_engine;
mod reference_set;
mod remote_document_cache;
mod target_cache;
pub mod target_data;

#[doc(inline)]
pub use document_overlay_cache::MemoryDocumentOverlayCache;
#[doc(inline)]
pub use index_manager::MemoryIndexManager;
#[doc(inline)]
pub use local_documents_view::{LocalDocumentsView, MutableDocumentMap};
#[doc(inline)]
pub use local_store::{
    LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, RemovedWrites, UserChangeResult,
};
#[doc(inline)]
pub use lru_garbage_collector::{LruGarbageCollector, LruParams, LruResults};
#[doc(inline)]
pub use lru_scheduler::LruScheduler;
#[doc(inline)]
pub use mutation_queue::MemoryMutationQueue;
#[doc(inline)]
pub use persistence::MemoryPersistence;
#[doc(inline)]
pub use query_engine::QueryEngine;
#[doc(inline)]
pub use reference_set::{DocReference, ReferenceSet};
#[doc(inline)]
pub use remote_document_cache::MemoryRemoteDocumentCache;
#[doc(inline)]
pub use target_cache::MemoryTargetCache;
#[doc(inline)]
pub use target_data::{TargetData, TargetPurpose};
