use std::sync::{Arc, Weak};

use serde_json::{json, Value as JsonValue};

use crate::firestore::core::target::TargetId;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::local::TargetData;
use crate::firestore::model::SnapshotVersion;
use crate::firestore::remote::datastore::{
    box_stream_future, StreamKind, StreamingDatastore, StreamingFuture, TokenProviderArc,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamHandler, StreamSettings};
use crate::firestore::remote::watch_change::{decode_watch_change, snapshot_version_of, WatchChange};
use crate::util::AsyncQueue;

/// Receives decoded listen responses.
pub trait WatchStreamListener: Send + Sync + 'static {
    fn on_watch_stream_open(&self) -> StreamingFuture<'_, ()>;

    /// `snapshot_version` is `SnapshotVersion::min()` unless the change marks
    /// a consistent snapshot across all targets.
    fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> StreamingFuture<'_, FirestoreResult<()>>;

    fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> StreamingFuture<'_, ()>;
}

/// The listen stream: adds and removes targets and decodes the changes the
/// backend reports for them.
pub struct WatchStream {
    stream: Arc<PersistentStream>,
    serializer: JsonProtoSerializer,
    listener: Weak<dyn WatchStreamListener>,
}

impl WatchStream {
    pub fn new(
        queue: AsyncQueue,
        datastore: Arc<dyn StreamingDatastore>,
        auth_provider: TokenProviderArc,
        app_check_provider: TokenProviderArc,
        serializer: JsonProtoSerializer,
        settings: StreamSettings,
        listener: Weak<dyn WatchStreamListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<WatchStream>| {
            let handler: Weak<dyn PersistentStreamHandler> = weak.clone();
            Self {
                stream: PersistentStream::new(
                    StreamKind::Listen,
                    queue,
                    datastore,
                    auth_provider,
                    app_check_provider,
                    settings,
                    handler,
                ),
                serializer,
                listener,
            }
        })
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub async fn stop(&self) {
        self.stream.stop().await;
    }

    pub async fn shutdown(&self) {
        self.stream.shutdown().await;
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    /// Asks the backend to start reporting changes for the target.
    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let mut request = json!({
            "database": self.serializer.database_name(),
            "addTarget": self.serializer.encode_target(target_data),
        });
        if let Some(labels) = self.serializer.encode_listen_request_labels(target_data) {
            request["labels"] = json!(labels);
        }
        self.stream.send(request).await
    }

    pub async fn unwatch(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.stream
            .send(json!({
                "database": self.serializer.database_name(),
                "removeTarget": target_id,
            }))
            .await
    }
}

impl PersistentStreamHandler for WatchStream {
    fn on_open(&self) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            if let Some(listener) = self.listener.upgrade() {
                listener.on_watch_stream_open().await;
            }
        })
    }

    fn on_message(&self, message: JsonValue) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            let Some(change) = decode_watch_change(&self.serializer, &message)? else {
                log::debug!("ignoring unrecognized listen response");
                return Ok(());
            };
            let snapshot_version = snapshot_version_of(&change);
            match self.listener.upgrade() {
                Some(listener) => listener.on_watch_change(change, snapshot_version).await,
                None => Ok(()),
            }
        })
    }

    fn on_close(&self, error: Option<FirestoreError>) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            if let Some(listener) = self.listener.upgrade() {
                listener.on_watch_stream_close(error).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::TargetPurpose;
    use crate::firestore::model::{DatabaseId, ResourcePath};
    use crate::firestore::remote::datastore::InMemoryStreamingDatastore;
    use crate::firestore::remote::watch_change::WatchTargetChangeState;
    use crate::platform::runtime;
    use crate::platform::token::EmptyTokenProvider;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingListener {
        changes: Mutex<Vec<(WatchChange, SnapshotVersion)>>,
        opened: Mutex<bool>,
    }

    impl WatchStreamListener for RecordingListener {
        fn on_watch_stream_open(&self) -> StreamingFuture<'_, ()> {
            box_stream_future(async move { *self.opened.lock().unwrap() = true })
        }

        fn on_watch_change(
            &self,
            change: WatchChange,
            snapshot_version: SnapshotVersion,
        ) -> StreamingFuture<'_, FirestoreResult<()>> {
            box_stream_future(async move {
                self.changes.lock().unwrap().push((change, snapshot_version));
                Ok(())
            })
        }

        fn on_watch_stream_close(&self, _error: Option<FirestoreError>) -> StreamingFuture<'_, ()> {
            box_stream_future(async {})
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn watch_sends_add_target_and_decodes_changes() {
        let queue = AsyncQueue::new();
        let (datastore, server) = InMemoryStreamingDatastore::new();
        let listener = Arc::new(RecordingListener::default());
        let weak_listener: Weak<dyn WatchStreamListener> = Arc::downgrade(&listener) as Weak<dyn WatchStreamListener>;
        let stream = WatchStream::new(
            queue.clone(),
            datastore,
            Arc::new(EmptyTokenProvider),
            Arc::new(EmptyTokenProvider),
            JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
            StreamSettings::default(),
            weak_listener,
        );
        stream.start();
        let backend = server.recv().await.unwrap();
        let opened = listener.clone();
        wait_until(move || *opened.opened.lock().unwrap()).await;

        let target = Query::new(ResourcePath::from_segments(["rooms"])).to_target();
        let target_data = TargetData::new(target, 2, TargetPurpose::ExistenceFilterMismatch, 1);
        stream.watch(&target_data).await.unwrap();
        let request = backend.stream.next_message().await.unwrap().unwrap();
        assert_eq!(request["database"], "projects/p/databases/(default)");
        assert_eq!(request["addTarget"]["targetId"], 2);
        assert_eq!(request["labels"]["goog-listen-tags"], "existence-filter-mismatch");

        stream.unwatch(2).await.unwrap();
        let request = backend.stream.next_message().await.unwrap().unwrap();
        assert_eq!(request["removeTarget"], 2);

        backend
            .stream
            .send_message(json!({
                "targetChange": { "targetChangeType": "NO_CHANGE", "readTime": "2024-01-01T00:00:00Z" }
            }))
            .await
            .unwrap();
        let changes = listener.clone();
        wait_until(move || changes.changes.lock().unwrap().len() == 1).await;
        let (change, version) = listener.changes.lock().unwrap()[0].clone();
        match change {
            WatchChange::TargetChange(change) => assert_eq!(change.state, WatchTargetChangeState::NoChange),
            other => panic!("unexpected change {other:?}"),
        }
        assert!(version > SnapshotVersion::min());
    }
}
