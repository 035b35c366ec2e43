mod database_id;
mod document;
mod document_key;
mod field_mask;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod object_value;
mod overlay;
pub mod resource_path;
mod snapshot_version;
mod timestamp;
mod transform;

pub use database_id::DatabaseId;
pub use document::{Document, DocumentState, DocumentType, MutableDocument};
pub use document_key::DocumentKey;
pub use field_mask::FieldMask;
pub use field_path::{FieldPath, IntoFieldPath, DOCUMENT_KEY_NAME};
pub use geo_point::GeoPoint;
pub use mutation::{calculate_overlay_mutation, Mutation, MutationResult, Precondition};
pub use mutation_batch::{DocumentVersionMap, MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use object_value::ObjectValue;
pub use overlay::{Overlay, OverlayedDocument};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use transform::{FieldTransform, TransformOperation};

use crate::util::{SortedMap, SortedSet};

/// Ordered set of document keys with cheap snapshots.
pub type DocumentKeySet = SortedSet<DocumentKey>;

/// Ordered map from key to document with cheap snapshots.
pub type DocumentMap = SortedMap<DocumentKey, MutableDocument>;
