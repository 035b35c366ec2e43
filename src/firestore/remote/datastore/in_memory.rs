use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use serde_json::Value as JsonValue;

use super::{box_stream_future, StreamCredentials, StreamHandle, StreamingDatastore, StreamingFuture};
use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

#[derive(Debug)]
enum Frame {
    Message(JsonValue),
    Error(FirestoreError),
}

/// One end of an in-process stream. Messages sent on one end arrive at the
/// other; closing either end ends the stream for both.
pub struct InMemoryStream {
    outbound: Sender<Frame>,
    inbound: Receiver<Frame>,
}

impl InMemoryStream {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();
        let left = Arc::new(Self {
            outbound: right_tx,
            inbound: left_rx,
        });
        let right = Arc::new(Self {
            outbound: left_tx,
            inbound: right_rx,
        });
        (left, right)
    }

    pub async fn send_message(&self, message: JsonValue) -> FirestoreResult<()> {
        self.outbound
            .send(Frame::Message(message))
            .await
            .map_err(|_| internal_error("in-memory stream is closed"))
    }

    /// Fails the stream: the peer receives `error` and the stream closes.
    pub async fn fail(&self, error: FirestoreError) {
        let _ = self.outbound.send(Frame::Error(error)).await;
        self.close_channels();
    }

    pub async fn next_message(&self) -> Option<FirestoreResult<JsonValue>> {
        match self.inbound.recv().await {
            Ok(Frame::Message(message)) => Some(Ok(message)),
            Ok(Frame::Error(error)) => Some(Err(error)),
            Err(_) => None,
        }
    }

    /// Takes every message that already arrived without waiting.
    pub fn drain_messages(&self) -> Vec<JsonValue> {
        let mut messages = Vec::new();
        while let Ok(frame) = self.inbound.try_recv() {
            if let Frame::Message(message) = frame {
                messages.push(message);
            }
        }
        messages
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }

    fn close_channels(&self) {
        self.outbound.close();
        self.inbound.close();
    }
}

impl StreamHandle for InMemoryStream {
    fn send(&self, message: JsonValue) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(self.send_message(message))
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<JsonValue>>> {
        box_stream_future(self.next_message())
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            self.close_channels();
            Ok(())
        })
    }
}

/// The backend's end of a stream opened through [`InMemoryStreamingDatastore`].
pub struct ServerStream {
    pub kind: StreamKind,
    pub credentials: StreamCredentials,
    pub stream: Arc<InMemoryStream>,
}

/// Stream transport whose backend side is driven by the caller, typically a
/// test playing the server.
pub struct InMemoryStreamingDatastore {
    server_tx: Sender<ServerStream>,
    open_failures: Mutex<VecDeque<FirestoreError>>,
}

impl InMemoryStreamingDatastore {
    /// Returns the transport and the receiver on which every opened stream's
    /// backend end is delivered.
    pub fn new() -> (Arc<Self>, Receiver<ServerStream>) {
        let (server_tx, server_rx) = async_channel::unbounded();
        let datastore = Arc::new(Self {
            server_tx,
            open_failures: Mutex::new(VecDeque::new()),
        });
        (datastore, server_rx)
    }

    /// Makes the next open attempt fail with `error`.
    pub fn fail_next_open(&self, error: FirestoreError) {
        self.lock_failures().push_back(error);
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, VecDeque<FirestoreError>> {
        match self.open_failures.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn open(&self, kind: StreamKind, credentials: StreamCredentials) -> FirestoreResult<Arc<dyn StreamHandle>> {
        let failure = self.lock_failures().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        let (client, server) = InMemoryStream::pair();
        self.server_tx
            .send(ServerStream {
                kind,
                credentials,
                stream: server,
            })
            .await
            .map_err(|_| internal_error("in-memory backend is gone"))?;
        Ok(client as Arc<dyn StreamHandle>)
    }
}

impl StreamingDatastore for InMemoryStreamingDatastore {
    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        box_stream_future(self.open(StreamKind::Listen, credentials))
    }

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        box_stream_future(self.open(StreamKind::Write, credentials))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{unavailable, FirestoreErrorCode};
    use serde_json::json;

    #[tokio::test]
    async fn stream_exchange_roundtrip() {
        let (datastore, server) = InMemoryStreamingDatastore::new();
        let client = datastore
            .open_listen_stream(StreamCredentials {
                auth_token: Some("token".into()),
                app_check_token: None,
            })
            .await
            .unwrap();
        let server_stream = server.recv().await.unwrap();
        assert_eq!(server_stream.kind, StreamKind::Listen);
        assert_eq!(server_stream.credentials.auth_token.as_deref(), Some("token"));

        client.send(json!({ "hello": 1 })).await.unwrap();
        assert_eq!(server_stream.stream.next_message().await.unwrap().unwrap(), json!({ "hello": 1 }));

        server_stream.stream.send_message(json!({ "world": 2 })).await.unwrap();
        assert_eq!(client.next().await.unwrap().unwrap(), json!({ "world": 2 }));
    }

    #[tokio::test]
    async fn closing_stream_notifies_peer() {
        let (left, right) = InMemoryStream::pair();
        left.close().await.unwrap();
        assert!(right.next().await.is_none());
        assert!(right.send(json!({})).await.is_err());
    }

    #[tokio::test]
    async fn failures_reach_the_client() {
        let (datastore, server) = InMemoryStreamingDatastore::new();
        datastore.fail_next_open(unavailable("down"));
        let err = datastore.open_write_stream(StreamCredentials::default()).await.err().unwrap();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);

        let client = datastore.open_write_stream(StreamCredentials::default()).await.unwrap();
        let server_stream = server.recv().await.unwrap();
        server_stream.stream.fail(unavailable("reset")).await;
        assert_eq!(client.next().await.unwrap().unwrap_err().code, FirestoreErrorCode::Unavailable);
        assert!(client.next().await.is_none());
    }
}
