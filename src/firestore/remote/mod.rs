pub mod bloom_filter;
pub mod connection;
pub mod datastore;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod serializer;
pub mod stream;
pub mod streams;
mod structured_query;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use connection::{Connection, ConnectionBuilder, RequestContext};
pub use datastore::{
    Datastore, DisconnectedStreamingDatastore, HttpDatastore, HttpDatastoreBuilder, InMemoryStreamingDatastore, RetrySettings, StreamCredentials,
    StreamHandle, StreamingDatastore, TokenProviderArc,
};
pub use online_state_tracker::{OnlineStateTracker, ONLINE_STATE_TIMEOUT};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
pub use rpc_error::{map_grpc_status, map_http_error};
pub use serializer::JsonProtoSerializer;
pub use stream::{PersistentStream, PersistentStreamState, StreamSettings};
pub use streams::{WatchStream, WriteStream};
pub use watch_change::WatchChange;
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
