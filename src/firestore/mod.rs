//! Offline-first document database client.
//!
//! Writes are applied to the local cache immediately and synchronised with
//! the backend through the listen and write streams. Reads and listeners are
//! served from the cache, so the client keeps working while offline.

pub mod api;
mod constants;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
pub mod value;

pub use api::field_value::{array_remove, array_union, delete_field, increment, server_timestamp};
pub use api::{
    get_firestore, get_firestore_for_database, initialize_firestore, register_firestore_component, CollectionReference,
    DocumentChange, DocumentChangeType, DocumentData, DocumentReference, DocumentSnapshot, Firestore, FirestoreConfig,
    ListenerRegistration, Query, QuerySnapshot, ServerTimestampBehavior, SetOptions, SnapshotListenOptions,
    SnapshotMetadata, WriteCompletion,
};
pub use constants::{CACHE_SIZE_UNLIMITED, DEFAULT_CACHE_SIZE_BYTES};
pub use self::core::{Direction, Filter, FilterOperator};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use model::{FieldPath, GeoPoint, Timestamp};
pub use settings::FirestoreSettings;
pub use value::FirestoreValue;
