pub mod bound;
pub mod document_set;
pub mod event_manager;
pub mod filter;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod types;
pub mod view;
pub mod view_snapshot;

pub use bound::Bound;
pub use document_set::DocumentSet;
pub use event_manager::{EventManager, ListenOptions, ListenerId, QueryHandler, QueryListener, SnapshotObserver};
pub use filter::{CompositeFilter, CompositeOperator, FieldFilter, Filter, FilterOperator};
pub use query::{Direction, LimitType, OrderBy, Query};
pub use sync_engine::{SyncEngine, SyncEngineListener, WriteCompletion};
pub use target::{Target, TargetId, TargetIdGenerator};
pub use types::{ListenSequence, ListenSequenceNumber, OnlineState, INVALID_SEQUENCE_NUMBER};
pub use view::{LimboDocumentChange, View, ViewChange, ViewDocumentChanges};
pub use view_snapshot::{ChangeType, DocumentChangeSet, DocumentViewChange, SyncState, ViewSnapshot};
