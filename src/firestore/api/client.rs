use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use crate::firestore::core::{
    EventManager, ListenOptions, ListenerId, QueryHandler, SnapshotObserver, SyncEngine, SyncEngineListener, View,
    ViewSnapshot, WriteCompletion,
};
use crate::firestore::core::{DocumentSet, Query};
use crate::firestore::error::{failed_precondition, internal_error, unavailable, FirestoreResult};
use crate::firestore::local::{LocalStore, LruParams, LruScheduler};
use crate::firestore::model::{DatabaseId, DocumentKey, DocumentKeySet, MutableDocument, Mutation};
use crate::firestore::remote::{
    ConnectionBuilder, Datastore, DisconnectedStreamingDatastore, HttpDatastore, JsonProtoSerializer, RemoteStore,
    StreamSettings, StreamingDatastore, TokenProviderArc,
};
use crate::firestore::settings::FirestoreSettings;
use crate::platform::token::{EmptyTokenProvider, User};
use crate::util::AsyncQueue;

/// Everything a client needs besides its database id. Applied with
/// [`initialize_firestore`](super::initialize_firestore) before the first
/// operation.
#[derive(Clone)]
pub struct FirestoreConfig {
    pub settings: FirestoreSettings,
    /// Transport of the listen and write streams. Without one the client
    /// works offline against its local cache.
    pub streaming_datastore: Option<Arc<dyn StreamingDatastore>>,
    /// Unary RPCs used by server reads. Defaults to the REST datastore for
    /// `settings.host`.
    pub datastore: Option<Arc<dyn Datastore>>,
    pub auth_provider: Option<TokenProviderArc>,
    pub app_check_provider: Option<TokenProviderArc>,
}

impl Default for FirestoreConfig {
    fn default() -> Self {
        Self {
            settings: FirestoreSettings::default().with_environment_overrides(),
            streaming_datastore: None,
            datastore: None,
            auth_provider: None,
            app_check_provider: None,
        }
    }
}

impl fmt::Debug for FirestoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirestoreConfig")
            .field("settings", &self.settings)
            .field("streaming_datastore", &self.streaming_datastore.is_some())
            .field("datastore", &self.datastore.is_some())
            .field("auth_provider", &self.auth_provider.is_some())
            .field("app_check_provider", &self.app_check_provider.is_some())
            .finish()
    }
}

/// The running engine behind a `Firestore` handle. Every call into the sync
/// engine, the event manager or the local store goes through the async queue.
pub(crate) struct FirestoreClient {
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    lru_scheduler: Arc<LruScheduler>,
    remote_store: Arc<RemoteStore>,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    datastore: Arc<dyn Datastore>,
}

impl FirestoreClient {
    pub(crate) async fn start(database_id: DatabaseId, config: FirestoreConfig) -> FirestoreResult<Arc<Self>> {
        let FirestoreConfig {
            settings,
            streaming_datastore,
            datastore,
            auth_provider,
            app_check_provider,
        } = config;
        settings.validate()?;

        let auth_provider: TokenProviderArc = auth_provider.unwrap_or_else(|| Arc::new(EmptyTokenProvider));
        let app_check_provider: TokenProviderArc =
            app_check_provider.unwrap_or_else(|| Arc::new(EmptyTokenProvider));
        let streaming_datastore: Arc<dyn StreamingDatastore> =
            streaming_datastore.unwrap_or_else(|| Arc::new(DisconnectedStreamingDatastore));
        let datastore: Arc<dyn Datastore> = match datastore {
            Some(datastore) => datastore,
            None => Arc::new(
                HttpDatastore::builder(database_id.clone())
                    .with_auth_provider(Arc::clone(&auth_provider))
                    .with_app_check_provider(Arc::clone(&app_check_provider))
                    .with_connection_builder(
                        ConnectionBuilder::new(database_id.clone()).with_host(settings.host.clone(), settings.ssl),
                    )
                    .build()?,
            ),
        };

        let user = auth_provider.current_user();
        log::debug!(
            "starting client for {} as {}",
            database_id.canonical_name(),
            user.to_key()
        );

        let queue = AsyncQueue::new();
        let lru_params = if settings.gc_enabled() {
            LruParams::with_cache_size(settings.cache_size_bytes)
        } else {
            LruParams::disabled()
        };
        let local_store = Arc::new(LocalStore::new(&user, lru_params));
        let lru_scheduler = LruScheduler::new(queue.clone(), &local_store);

        let engine_slot: Arc<OnceLock<Weak<SyncEngine>>> = Arc::new(OnceLock::new());
        let handler_slot = Arc::clone(&engine_slot);
        let stream_settings = StreamSettings {
            backoff: settings.stream_backoff.clone(),
            idle_timeout: settings.stream_idle_timeout,
            online_state_timeout: settings.online_state_timeout,
        };
        let remote_store = RemoteStore::new(
            queue.clone(),
            Arc::clone(&local_store),
            streaming_datastore,
            auth_provider,
            app_check_provider,
            JsonProtoSerializer::new(database_id),
            stream_settings,
            Arc::new(move |online_state| {
                if let Some(engine) = handler_slot.get().and_then(Weak::upgrade) {
                    engine.apply_online_state_change(online_state);
                }
            }),
        );

        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            Arc::clone(&remote_store),
            user,
            settings.max_concurrent_limbo_resolutions,
        );
        let _ = engine_slot.set(Arc::downgrade(&sync_engine));

        let handler: Arc<dyn QueryHandler> = Arc::clone(&sync_engine) as Arc<dyn QueryHandler>;
        let event_manager = Arc::new(EventManager::new(handler));
        let listener: Weak<dyn SyncEngineListener> = Arc::downgrade(&event_manager) as Weak<dyn SyncEngineListener>;
        sync_engine.set_listener(listener);

        let client = Arc::new(Self {
            queue,
            local_store,
            lru_scheduler,
            remote_store,
            sync_engine,
            event_manager,
            datastore,
        });
        if let Some(Err(err)) = client.queue.enqueue(client.remote_store.start()).await {
            // A failed first connection only means the client starts offline.
            log::debug!("remote store could not start the network: {err}");
        }
        client.lru_scheduler.start();
        Ok(client)
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.queue.is_shut_down()
    }

    /// Applies `mutations` locally as one batch. The returned completion
    /// resolves when the backend accepts or rejects the batch.
    pub(crate) async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        self.queue
            .enqueue(self.sync_engine.write(mutations))
            .await
            .ok_or_else(terminated)?
    }

    /// The cached document, either found or known to be missing.
    pub(crate) async fn get_document_from_local_cache(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        let document = self
            .queue
            .enqueue(self.local_store.read_document(key))
            .await
            .ok_or_else(terminated)?;
        if document.is_found_document() || document.is_no_document() {
            Ok(document)
        } else {
            Err(unavailable(
                "Failed to get document from cache. The document may exist on the server; read it from the server instead.",
            ))
        }
    }

    pub(crate) async fn get_documents_from_local_cache(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let local_store = &self.local_store;
        self.queue
            .enqueue(async move {
                let result = local_store.execute_query(query, true).await;
                let mut view = View::new(query.clone(), result.remote_keys);
                let changes = view.compute_doc_changes(&result.documents, None);
                view.apply_changes(changes, false, None, false)
                    .snapshot
                    .ok_or_else(|| internal_error("a new view must produce a snapshot"))
            })
            .await
            .ok_or_else(terminated)?
    }

    /// Reads one document from the backend, bypassing the cache.
    pub(crate) async fn get_document_from_server(&self, key: &DocumentKey) -> FirestoreResult<MutableDocument> {
        self.verify_not_terminated()?;
        let mut documents = self.datastore.batch_get_documents(std::slice::from_ref(key)).await?;
        documents
            .pop()
            .ok_or_else(|| internal_error("batchGet returned no document"))
    }

    /// Runs `query` on the backend, bypassing the cache.
    pub(crate) async fn get_documents_from_server(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        self.verify_not_terminated()?;
        let documents = self.datastore.run_query(query).await?;
        let docs = documents
            .into_iter()
            .fold(DocumentSet::new(query.comparator()), |set, document| set.insert(document));
        Ok(ViewSnapshot::from_initial_documents(
            query.clone(),
            docs,
            DocumentKeySet::new(),
            false,
            false,
        ))
    }

    pub(crate) async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: SnapshotObserver,
    ) -> FirestoreResult<ListenerId> {
        self.queue
            .enqueue(self.event_manager.listen(query, options, observer))
            .await
            .ok_or_else(terminated)?
    }

    pub(crate) async fn unlisten(&self, query: &Query, listener_id: ListenerId) -> FirestoreResult<()> {
        // Listeners removed after termination have nothing left to stop.
        self.queue
            .enqueue(self.event_manager.unlisten(query, listener_id))
            .await
            .unwrap_or(Ok(()))
    }

    pub(crate) async fn enable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(self.remote_store.enable_network())
            .await
            .ok_or_else(terminated)?
    }

    pub(crate) async fn disable_network(&self) -> FirestoreResult<()> {
        self.queue
            .enqueue(self.remote_store.disable_network())
            .await
            .ok_or_else(terminated)
    }

    /// Resolves once every write pending at the time of the call has been
    /// acknowledged or rejected by the backend.
    pub(crate) async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let completion = self
            .queue
            .enqueue(self.sync_engine.register_pending_writes_callback())
            .await
            .ok_or_else(terminated)?;
        completion.wait().await
    }

    /// Switches the local state to `user` and restarts the streams with the
    /// new credentials.
    pub(crate) async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.queue
            .enqueue(self.remote_store.handle_credential_change(user))
            .await
            .ok_or_else(terminated)?
    }

    pub(crate) fn current_user(&self) -> User {
        self.sync_engine.current_user()
    }

    /// Stops the streams and shuts the queue down. Later operations fail with
    /// `failed-precondition`.
    pub(crate) async fn terminate(&self) {
        if self.is_terminated() {
            return;
        }
        log::debug!("terminating client");
        self.lru_scheduler.stop();
        self.queue.shutdown();
        self.queue
            .enqueue_even_while_shut_down(self.remote_store.shutdown())
            .await;
    }

    fn verify_not_terminated(&self) -> FirestoreResult<()> {
        if self.is_terminated() {
            return Err(terminated());
        }
        Ok(())
    }
}

pub(crate) fn terminated() -> crate::firestore::error::FirestoreError {
    failed_precondition("The client has already been terminated.")
}
