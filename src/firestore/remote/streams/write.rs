use std::sync::{Arc, Mutex, MutexGuard, Weak};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, SnapshotVersion};
use crate::firestore::remote::datastore::{
    box_stream_future, StreamKind, StreamingDatastore, StreamingFuture, TokenProviderArc,
};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, PersistentStreamHandler, StreamSettings};
use crate::util::{hard_assert, AsyncQueue};

/// Receives write stream events.
pub trait WriteStreamListener: Send + Sync + 'static {
    fn on_write_stream_open(&self) -> StreamingFuture<'_, ()>;

    /// The backend answered the handshake; mutations may now be written.
    fn on_write_handshake_complete(&self) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// The oldest outstanding write was committed.
    fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> StreamingFuture<'_, FirestoreResult<()>>;

    fn on_write_stream_close(&self, error: Option<FirestoreError>) -> StreamingFuture<'_, ()>;
}

#[derive(Default)]
struct WriteStreamState {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

/// The write stream. After a handshake that yields a stream token, every
/// `write_mutations` request is answered in order with the commit results of
/// one batch.
pub struct WriteStream {
    stream: Arc<PersistentStream>,
    serializer: JsonProtoSerializer,
    listener: Weak<dyn WriteStreamListener>,
    state: Mutex<WriteStreamState>,
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        datastore: Arc<dyn StreamingDatastore>,
        auth_provider: TokenProviderArc,
        app_check_provider: TokenProviderArc,
        serializer: JsonProtoSerializer,
        settings: StreamSettings,
        listener: Weak<dyn WriteStreamListener>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<WriteStream>| {
            let handler: Weak<dyn PersistentStreamHandler> = weak.clone();
            Self {
                stream: PersistentStream::new(
                    StreamKind::Write,
                    queue,
                    datastore,
                    auth_provider,
                    app_check_provider,
                    settings,
                    handler,
                ),
                serializer,
                listener,
                state: Mutex::new(WriteStreamState::default()),
            }
        })
    }

    pub fn start(&self) {
        self.lock_state().handshake_complete = false;
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

    pub fn handshake_complete(&self) -> bool {
        self.lock_state().handshake_complete
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        self.lock_state().last_stream_token.clone()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        self.lock_state().last_stream_token = token;
    }

    /// Sends the initial request that identifies the database.
    pub async fn write_handshake(&self) -> FirestoreResult<()> {
        hard_assert(self.is_open(), 0x0a1b, "writing handshake requires an open stream");
        hard_assert(!self.handshake_complete(), 0xdc3f, "handshake already completed");
        self.stream
            .send(json!({ "database": self.serializer.database_name() }))
            .await
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        hard_assert(self.is_open(), 0x6d4d, "writing mutations requires an open stream");
        hard_assert(
            self.handshake_complete(),
            0x91a2,
            "handshake must complete before writing mutations",
        );
        let writes: Vec<JsonValue> = mutations
            .iter()
            .map(|mutation| self.serializer.encode_mutation(mutation))
            .collect();
        let request = json!({
            "streamToken": BASE64_STANDARD.encode(self.last_stream_token()),
            "writes": writes,
        });
        self.stream.send(request).await
    }

    fn lock_state(&self) -> MutexGuard<'_, WriteStreamState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn handle_response(&self, message: JsonValue) -> FirestoreResult<()> {
        let token = match message.get("streamToken").and_then(JsonValue::as_str) {
            Some(encoded) => BASE64_STANDARD
                .decode(encoded)
                .map_err(|err| internal_error(format!("invalid stream token: {err}")))?,
            None => Vec::new(),
        };
        let was_handshake = {
            let mut state = self.lock_state();
            state.last_stream_token = token;
            let was_handshake = !state.handshake_complete;
            state.handshake_complete = true;
            was_handshake
        };
        let Some(listener) = self.listener.upgrade() else {
            return Ok(());
        };

        if was_handshake {
            let has_results = message
                .get("writeResults")
                .and_then(JsonValue::as_array)
                .is_some_and(|results| !results.is_empty());
            hard_assert(!has_results, 0x7a5c, "handshake response carried write results");
            return listener.on_write_handshake_complete().await;
        }

        let commit_version = self.serializer.decode_version(message.get("commitTime"))?;
        let results = self
            .serializer
            .decode_write_results(message.get("writeResults"), commit_version)?;
        listener.on_mutation_result(commit_version, results).await
    }
}

impl PersistentStreamHandler for WriteStream {
    fn on_open(&self) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            if let Some(listener) = self.listener.upgrade() {
                listener.on_write_stream_open().await;
            }
        })
    }

    fn on_message(&self, message: JsonValue) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(self.handle_response(message))
    }

    fn on_close(&self, error: Option<FirestoreError>) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            if let Some(listener) = self.listener.upgrade() {
                listener.on_write_stream_close(error).await;
            }
        })
    }
}
