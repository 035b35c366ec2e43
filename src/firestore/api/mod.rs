mod client;
mod database;
pub mod field_value;
pub(crate) mod operations;
mod query;
mod reference;
mod snapshot;

pub use client::FirestoreConfig;
pub use database::{
    get_firestore, get_firestore_for_database, initialize_firestore, register_firestore_component, DocumentData,
    Firestore, ListenerRegistration, SnapshotListenOptions,
};
pub use field_value::IncrementOperand;
pub use operations::SetOptions;
pub use query::Query;
pub use reference::{CollectionReference, DocumentReference};
pub use snapshot::{
    DocumentChange, DocumentChangeType, DocumentSnapshot, QuerySnapshot, ServerTimestampBehavior, SnapshotMetadata,
};

pub use crate::firestore::core::WriteCompletion;

/// A handle on a fresh app, for unit tests that build references and
/// queries.
#[cfg(test)]
pub(crate) fn test_firestore() -> Firestore {
    use crate::firestore::model::DatabaseId;
    use crate::test_support::test_app;

    Firestore::new(test_app("test-project"), DatabaseId::new("test-project", "(default)"), None)
}
