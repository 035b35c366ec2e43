use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};

use crate::app;
use crate::app::{get_app, FirebaseApp};
use crate::component::types::{ComponentError, DynService, InstanceFactoryOptions, InstantiationMode};
use crate::component::{Component, ComponentType};
use crate::firestore::constants::FIRESTORE_COMPONENT_NAME;
use crate::firestore::core::{self, ListenOptions, ListenerId, WriteCompletion};
use crate::firestore::error::{failed_precondition, internal_error, invalid_argument, missing_project_id, FirestoreResult};
use crate::firestore::model::{DatabaseId, Mutation, ResourcePath};
use crate::firestore::value::FirestoreValue;
use crate::platform::runtime::spawn_detached;
use crate::platform::token::User;

use super::client::{terminated, FirestoreClient, FirestoreConfig};
use super::operations::{parse_set_data, parse_update_data, SetOptions};
use super::query::Query;
use super::reference::{CollectionReference, DocumentReference};
use super::snapshot::{document_snapshot_from_view, DocumentSnapshot, QuerySnapshot, SnapshotMetadata};

/// Document data as written by the client: top-level field names to values.
pub type DocumentData = BTreeMap<String, FirestoreValue>;

/// Options of a snapshot listener.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotListenOptions {
    /// Also raise events when only the snapshot metadata changed.
    pub include_metadata_changes: bool,
}

/// A handle on one database of a Firebase app.
///
/// The engine behind it starts on the first operation that needs it. Cloning
/// the handle shares the engine.
#[derive(Clone)]
pub struct Firestore {
    inner: Arc<FirestoreInner>,
}

struct FirestoreInner {
    app: FirebaseApp,
    database_id: DatabaseId,
    instance_identifier: Option<String>,
    config: Mutex<FirestoreConfig>,
    client: async_lock::Mutex<Option<Arc<FirestoreClient>>>,
    terminated: AtomicBool,
}

impl fmt::Debug for Firestore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Firestore")
            .field("app", &self.inner.app.name())
            .field("database_id", &self.inner.database_id)
            .finish()
    }
}

impl Firestore {
    pub(crate) fn new(app: FirebaseApp, database_id: DatabaseId, instance_identifier: Option<String>) -> Self {
        let inner = FirestoreInner {
            app,
            database_id,
            instance_identifier,
            config: Mutex::new(FirestoreConfig::default()),
            client: async_lock::Mutex::new(None),
            terminated: AtomicBool::new(false),
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn app(&self) -> &FirebaseApp {
        &self.inner.app
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    pub fn project_id(&self) -> &str {
        self.inner.database_id.project_id()
    }

    /// The logical database name, usually `"(default)"`.
    pub fn database(&self) -> &str {
        self.inner.database_id.database()
    }

    /// Creates a `CollectionReference` for a slash-separated path such as
    /// `"users/alovelace/repos"`.
    pub fn collection(&self, path: &str) -> FirestoreResult<CollectionReference> {
        let resource = ResourcePath::from_string(path)?;
        CollectionReference::new(self.clone(), resource)
    }

    /// Creates a `DocumentReference`. The path must have an even number of
    /// segments.
    pub fn doc(&self, path: &str) -> FirestoreResult<DocumentReference> {
        let resource = ResourcePath::from_string(path)?;
        DocumentReference::new(self.clone(), resource)
    }

    /// A query over every collection named `collection_id`, whatever its
    /// parent.
    pub fn collection_group(&self, collection_id: &str) -> FirestoreResult<Query> {
        if collection_id.is_empty() || collection_id.contains('/') {
            return Err(invalid_argument(format!(
                "Invalid collection id '{collection_id}' passed to collection_group(). Collection ids must not contain '/'"
            )));
        }
        Ok(Query::from_core(self.clone(), core::Query::collection_group(collection_id)))
    }

    /// Replaces the client configuration. Only allowed before the engine has
    /// started.
    pub fn configure(&self, config: FirestoreConfig) -> FirestoreResult<()> {
        config.settings.validate()?;
        if self.is_started() {
            return Err(failed_precondition(
                "Firestore has already been started and its settings can no longer be changed",
            ));
        }
        *self.lock_config() = config;
        Ok(())
    }

    /// Whether the engine has been started by an earlier operation.
    pub fn is_started(&self) -> bool {
        self.inner
            .client
            .try_lock()
            .map(|client| client.is_some())
            .unwrap_or(true)
    }

    /// Overwrites the document with `data`.
    pub async fn set_doc(&self, reference: &DocumentReference, data: DocumentData) -> FirestoreResult<WriteCompletion> {
        self.set_doc_with_options(reference, data, SetOptions::default()).await
    }

    /// Writes `data` to the document, merging it into existing fields when
    /// `options` asks for a merge.
    pub async fn set_doc_with_options(
        &self,
        reference: &DocumentReference,
        data: DocumentData,
        options: SetOptions,
    ) -> FirestoreResult<WriteCompletion> {
        self.verify_reference(reference)?;
        let mutation = parse_set_data(reference.key().clone(), data, &options)?;
        self.write(vec![mutation]).await
    }

    /// Updates fields of an existing document. Keys are dot-separated field
    /// paths. Fails on the backend when the document does not exist.
    pub async fn update_doc(&self, reference: &DocumentReference, data: DocumentData) -> FirestoreResult<WriteCompletion> {
        self.verify_reference(reference)?;
        let mutation = parse_update_data(reference.key().clone(), data)?;
        self.write(vec![mutation]).await
    }

    pub async fn delete_doc(&self, reference: &DocumentReference) -> FirestoreResult<WriteCompletion> {
        self.verify_reference(reference)?;
        self.write(vec![Mutation::delete(reference.key().clone())]).await
    }

    /// Writes `data` to a new document with a generated id and returns its
    /// reference.
    pub async fn add_doc(&self, collection: &CollectionReference, data: DocumentData) -> FirestoreResult<DocumentReference> {
        let reference = collection.doc(None)?;
        self.set_doc(&reference, data).await?;
        Ok(reference)
    }

    /// Reads the document from the local cache, including pending local
    /// writes. Fails with `unavailable` when the cache knows nothing about
    /// the document.
    pub async fn get_doc_from_cache(&self, reference: &DocumentReference) -> FirestoreResult<DocumentSnapshot> {
        self.verify_reference(reference)?;
        let client = self.client().await?;
        let document = client.get_document_from_local_cache(reference.key()).await?;
        let has_pending_writes = document.has_local_mutations();
        Ok(DocumentSnapshot::new(
            self.clone(),
            reference.key().clone(),
            Some(document),
            SnapshotMetadata::new(has_pending_writes, true),
        ))
    }

    pub async fn get_docs_from_cache(&self, query: &Query) -> FirestoreResult<QuerySnapshot> {
        self.verify_query(query)?;
        let client = self.client().await?;
        let snapshot = client.get_documents_from_local_cache(query.core()).await?;
        Ok(QuerySnapshot::new(query.clone(), snapshot))
    }

    /// Reads the document from the backend without touching the cache.
    pub async fn get_doc_from_server(&self, reference: &DocumentReference) -> FirestoreResult<DocumentSnapshot> {
        self.verify_reference(reference)?;
        let client = self.client().await?;
        let document = client.get_document_from_server(reference.key()).await?;
        Ok(DocumentSnapshot::new(
            self.clone(),
            reference.key().clone(),
            Some(document),
            SnapshotMetadata::default(),
        ))
    }

    pub async fn get_docs_from_server(&self, query: &Query) -> FirestoreResult<QuerySnapshot> {
        self.verify_query(query)?;
        let client = self.client().await?;
        let snapshot = client.get_documents_from_server(query.core()).await?;
        Ok(QuerySnapshot::new(query.clone(), snapshot))
    }

    /// Listens to the results of `query`. The observer first receives the
    /// cached results, then every change until the registration is removed.
    pub async fn on_snapshot<F>(
        &self,
        query: &Query,
        options: SnapshotListenOptions,
        observer: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<QuerySnapshot>) + Send + Sync + 'static,
    {
        self.verify_query(query)?;
        let muted = Arc::new(AtomicBool::new(false));
        let observer_muted = Arc::clone(&muted);
        let snapshot_query = query.clone();
        let observer: core::SnapshotObserver = Arc::new(move |result| {
            if observer_muted.load(Ordering::SeqCst) {
                return;
            }
            observer(result.map(|snapshot| QuerySnapshot::new(snapshot_query.clone(), snapshot)));
        });
        self.listen(query.core().clone(), options, observer, muted).await
    }

    /// Listens to one document. Snapshots of a missing document report
    /// `exists() == false`.
    pub async fn on_doc_snapshot<F>(
        &self,
        reference: &DocumentReference,
        options: SnapshotListenOptions,
        observer: F,
    ) -> FirestoreResult<ListenerRegistration>
    where
        F: Fn(FirestoreResult<DocumentSnapshot>) + Send + Sync + 'static,
    {
        self.verify_reference(reference)?;
        let muted = Arc::new(AtomicBool::new(false));
        let observer_muted = Arc::clone(&muted);
        let firestore = self.clone();
        let key = reference.key().clone();
        let observer: core::SnapshotObserver = Arc::new(move |result| {
            if observer_muted.load(Ordering::SeqCst) {
                return;
            }
            observer(result.map(|snapshot| document_snapshot_from_view(&firestore, &key, &snapshot)));
        });
        self.listen(reference.as_query(), options, observer, muted).await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.client().await?.enable_network().await
    }

    /// Stops all network traffic. Listeners keep receiving cached results
    /// and writes queue up until the network is enabled again.
    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.client().await?.disable_network().await
    }

    /// Resolves once every write issued so far has been acknowledged or
    /// rejected by the backend. Waits across offline periods.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        self.client().await?.wait_for_pending_writes().await
    }

    /// Switches the signed-in user. Pending writes of the previous user stay
    /// queued under that user and listeners are recomputed.
    pub async fn set_user(&self, user: User) -> FirestoreResult<()> {
        self.client().await?.handle_credential_change(user).await
    }

    pub async fn current_user(&self) -> FirestoreResult<User> {
        Ok(self.client().await?.current_user())
    }

    /// Shuts the instance down. Every later operation fails with
    /// `failed-precondition`, and `get_firestore` hands out a new instance.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        app::remove_service_instance(
            &self.inner.app,
            FIRESTORE_COMPONENT_NAME,
            self.inner.instance_identifier.as_deref(),
        );
        let client = self.inner.client.lock().await.clone();
        if let Some(client) = client {
            client.terminate().await;
        }
        Ok(())
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    /// Returns the running engine, starting it on first use.
    pub(crate) async fn client(&self) -> FirestoreResult<Arc<FirestoreClient>> {
        if self.is_terminated() {
            return Err(terminated());
        }
        let mut guard = self.inner.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(Arc::clone(client));
        }
        let config = self.lock_config().clone();
        let client = FirestoreClient::start(self.inner.database_id.clone(), config).await?;
        *guard = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        self.client().await?.write(mutations).await
    }

    async fn listen(
        &self,
        query: core::Query,
        options: SnapshotListenOptions,
        observer: core::SnapshotObserver,
        muted: Arc<AtomicBool>,
    ) -> FirestoreResult<ListenerRegistration> {
        let client = self.client().await?;
        let listen_options = ListenOptions {
            include_metadata_changes: options.include_metadata_changes,
            wait_for_sync_when_online: false,
        };
        let listener_id = client.listen(query.clone(), listen_options, observer).await?;
        Ok(ListenerRegistration {
            client,
            query,
            listener_id,
            muted,
        })
    }

    fn verify_reference(&self, reference: &DocumentReference) -> FirestoreResult<()> {
        if reference.firestore().database_id() != self.database_id() {
            return Err(invalid_argument(
                "Provided document reference is from a different Firestore instance",
            ));
        }
        Ok(())
    }

    fn verify_query(&self, query: &Query) -> FirestoreResult<()> {
        if query.firestore().database_id() != self.database_id() {
            return Err(invalid_argument("Provided query is from a different Firestore instance"));
        }
        query.validate_for_execution()
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, FirestoreConfig> {
        match self.inner.config.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Returned by `on_snapshot`; removing it stops the listener.
pub struct ListenerRegistration {
    client: Arc<FirestoreClient>,
    query: core::Query,
    listener_id: ListenerId,
    muted: Arc<AtomicBool>,
}

impl ListenerRegistration {
    /// Stops delivering events immediately and releases the listen once no
    /// other listener needs it.
    pub async fn remove(self) -> FirestoreResult<()> {
        self.muted.store(true, Ordering::SeqCst);
        self.client.unlisten(&self.query, self.listener_id).await
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("query", &self.query.canonical_id())
            .field("listener_id", &self.listener_id)
            .finish()
    }
}

static FIRESTORE_COMPONENT: LazyLock<()> = LazyLock::new(|| {
    let component = Component::new(FIRESTORE_COMPONENT_NAME, Arc::new(firestore_factory), ComponentType::Public)
        .with_instantiation_mode(InstantiationMode::Lazy)
        .with_multiple_instances(true)
        .with_instance_deleted_callback(|service: &DynService| {
            if let Ok(firestore) = Arc::clone(service).downcast::<Firestore>() {
                spawn_detached(async move {
                    if let Err(err) = firestore.terminate().await {
                        log::warn!("failed to terminate firestore on app deletion: {err}");
                    }
                });
            }
        });

    let _ = app::register_component(component);
});

fn firestore_factory(
    container: &crate::component::ComponentContainer,
    options: InstanceFactoryOptions,
) -> Result<DynService, ComponentError> {
    let app = container
        .root_service::<FirebaseApp>()
        .ok_or_else(|| ComponentError::InitializationFailed {
            name: FIRESTORE_COMPONENT_NAME.to_string(),
            reason: "Firebase app not attached to component container".to_string(),
        })?;

    let identifier = options.instance_identifier.filter(|identifier| !identifier.is_empty());
    let database_id = match identifier.as_deref() {
        Some(identifier) => parse_database_identifier(&app, identifier),
        None => DatabaseId::from_app(&app),
    }
    .map_err(|err| ComponentError::InitializationFailed {
        name: FIRESTORE_COMPONENT_NAME.to_string(),
        reason: err.to_string(),
    })?;

    log::debug!("creating firestore instance for {}", database_id.canonical_name());
    let firestore = Firestore::new((*app).clone(), database_id, identifier);
    Ok(Arc::new(firestore) as DynService)
}

fn parse_database_identifier(app: &FirebaseApp, identifier: &str) -> FirestoreResult<DatabaseId> {
    let options = app.options();
    let project_id = options.project_id.clone().ok_or_else(missing_project_id)?;

    if identifier.starts_with("projects/") {
        let segments: Vec<_> = identifier.split('/').collect();
        if segments.len() == 4 && segments[0] == "projects" && segments[2] == "databases" {
            return Ok(DatabaseId::new(segments[1], segments[3]));
        }
        return Err(invalid_argument(
            "Database identifier must follow projects/{project}/databases/{database}",
        ));
    }

    Ok(DatabaseId::new(project_id, identifier))
}

pub fn register_firestore_component() {
    LazyLock::force(&FIRESTORE_COMPONENT);
}

/// Resolves (or lazily creates) the default database of `app`, or of the
/// default app when `None`. Repeated calls share one instance until it is
/// terminated.
pub fn get_firestore(app: Option<FirebaseApp>) -> FirestoreResult<Arc<Firestore>> {
    get_firestore_for_database(app, None)
}

/// Like [`get_firestore`] for a named database, either a bare database name
/// or `projects/{project}/databases/{database}`.
pub fn get_firestore_for_database(app: Option<FirebaseApp>, database: Option<&str>) -> FirestoreResult<Arc<Firestore>> {
    register_firestore_component();
    let app = match app {
        Some(app) => app,
        None => get_app(None).map_err(|err| internal_error(err.to_string()))?,
    };

    let provider = app::get_provider(&app, FIRESTORE_COMPONENT_NAME);
    provider
        .get_immediate_with_options::<Firestore>(database, false)
        .map_err(|err| internal_error(err.to_string()))?
        .ok_or_else(|| internal_error("Failed to obtain Firestore instance"))
}

/// Resolves the database like [`get_firestore_for_database`] and applies
/// `config` to it. Fails when the instance has already started.
pub fn initialize_firestore(
    app: Option<FirebaseApp>,
    config: FirestoreConfig,
    database: Option<&str>,
) -> FirestoreResult<Arc<Firestore>> {
    let firestore = get_firestore_for_database(app, database)?;
    firestore.configure(config)?;
    Ok(firestore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;
    use crate::firestore::settings::FirestoreSettings;
    use crate::test_support::test_app;

    fn app() -> FirebaseApp {
        test_app("project")
    }

    fn data(field: &str, value: i64) -> DocumentData {
        BTreeMap::from([(field.to_string(), FirestoreValue::from_integer(value))])
    }

    #[test]
    fn get_firestore_registers_component() {
        let app = app();
        let firestore = get_firestore(Some(app.clone())).unwrap();
        assert_eq!(firestore.project_id(), "project");
        assert_eq!(firestore.database(), "(default)");
        let again = get_firestore(Some(app)).unwrap();
        assert!(Arc::ptr_eq(&firestore, &again));
    }

    #[test]
    fn custom_database_identifier() {
        let app = app();
        let firestore = get_firestore_for_database(Some(app.clone()), Some("projects/project/databases/custom")).unwrap();
        assert_eq!(firestore.database(), "custom");
        let named = get_firestore_for_database(Some(app), Some("other")).unwrap();
        assert_eq!(named.database(), "other");
    }

    #[test]
    fn collection_group_rejects_slashes() {
        let firestore = get_firestore(Some(app())).unwrap();
        assert!(firestore.collection_group("landmarks").is_ok());
        assert!(firestore.collection_group("cities/sf").is_err());
    }

    #[tokio::test]
    async fn configure_is_rejected_after_start() {
        let firestore = get_firestore(Some(app())).unwrap();
        let config = FirestoreConfig {
            settings: FirestoreSettings::default(),
            ..Default::default()
        };
        firestore.configure(config.clone()).unwrap();
        firestore.disable_network().await.unwrap();
        let err = firestore.configure(config).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }

    #[tokio::test]
    async fn writes_are_visible_in_the_cache() {
        let firestore = get_firestore(Some(app())).unwrap();
        let reference = firestore.doc("rooms/eros").unwrap();
        firestore.set_doc(&reference, data("count", 1)).await.unwrap();

        let snapshot = firestore.get_doc_from_cache(&reference).await.unwrap();
        assert!(snapshot.exists());
        assert!(snapshot.metadata().has_pending_writes);
        assert!(snapshot.metadata().from_cache);
        assert_eq!(snapshot.get("count").unwrap(), Some(FirestoreValue::from_integer(1)));

        firestore
            .update_doc(&reference, data("count", 2))
            .await
            .unwrap();
        let snapshot = firestore.get_doc_from_cache(&reference).await.unwrap();
        assert_eq!(snapshot.get("count").unwrap(), Some(FirestoreValue::from_integer(2)));

        firestore.delete_doc(&reference).await.unwrap();
        let snapshot = firestore.get_doc_from_cache(&reference).await.unwrap();
        assert!(!snapshot.exists());
    }

    #[tokio::test]
    async fn unknown_documents_are_unavailable_from_cache() {
        let firestore = get_firestore(Some(app())).unwrap();
        let reference = firestore.doc("rooms/unknown").unwrap();
        let err = firestore.get_doc_from_cache(&reference).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);
    }

    #[tokio::test]
    async fn terminate_rejects_later_operations() {
        let app = app();
        let firestore = get_firestore(Some(app.clone())).unwrap();
        let reference = firestore.doc("rooms/eros").unwrap();
        firestore.set_doc(&reference, data("count", 1)).await.unwrap();
        firestore.terminate().await.unwrap();

        let err = firestore.set_doc(&reference, data("count", 2)).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
        let fresh = get_firestore(Some(app)).unwrap();
        assert!(!Arc::ptr_eq(&firestore, &fresh));
        assert!(!fresh.is_terminated());
    }
}
