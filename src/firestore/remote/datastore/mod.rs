use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::core::query::Query;
use crate::firestore::error::{unavailable, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutableDocument, Mutation, MutationResult};
use crate::platform::token::AsyncTokenProvider;

pub mod http;
pub mod in_memory;

#[cfg(target_arch = "wasm32")]
pub type StreamingFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type StreamingFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    use futures::FutureExt;
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    use futures::FutureExt;
    future.boxed()
}

/// Unary RPCs against the backend.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait Datastore: Send + Sync + 'static {
    /// Commits the mutations atomically and returns one result per mutation.
    async fn commit(&self, mutations: &[Mutation]) -> FirestoreResult<Vec<MutationResult>>;

    /// Fetches the documents in the order of `keys`. Missing documents come
    /// back as `NoDocument`s.
    async fn batch_get_documents(&self, keys: &[DocumentKey]) -> FirestoreResult<Vec<MutableDocument>>;

    async fn run_query(&self, query: &Query) -> FirestoreResult<Vec<MutableDocument>>;
}

/// Tokens attached to a stream when it is opened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

/// One open bidirectional stream carrying JSON messages.
pub trait StreamHandle: Send + Sync {
    fn send(&self, message: JsonValue) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// Next inbound message. `None` once the peer closed the stream.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<JsonValue>>>;

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens the listen and write streams.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}

pub type TokenProviderArc = Arc<dyn AsyncTokenProvider>;

/// Stream transport used when no streaming backend is configured. Every open
/// fails with `unavailable`, so the client keeps serving reads and queueing
/// writes from its local cache.
#[derive(Debug, Default)]
pub struct DisconnectedStreamingDatastore;

impl DisconnectedStreamingDatastore {
    fn refuse(&self, kind: &str) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let message = format!("no {kind} stream transport is configured");
        box_stream_future(async move { Err(unavailable(message)) })
    }
}

impl StreamingDatastore for DisconnectedStreamingDatastore {
    fn open_listen_stream(
        &self,
        _credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.refuse("listen")
    }

    fn open_write_stream(
        &self,
        _credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.refuse("write")
    }
}

pub use http::{HttpDatastore, HttpDatastoreBuilder, RetrySettings};
pub use in_memory::{InMemoryStream, InMemoryStreamingDatastore, ServerStream, StreamKind};
