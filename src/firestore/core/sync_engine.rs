use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;

use crate::firestore::core::event_manager::QueryHandler;
use crate::firestore::core::query::Query;
use crate::firestore::core::target::{TargetId, TargetIdGenerator};
use crate::firestore::core::types::{OnlineState, INVALID_SEQUENCE_NUMBER};
use crate::firestore::core::view::{LimboDocumentChange, View};
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{cancelled, FirestoreError, FirestoreResult};
use crate::firestore::local::{
    LocalStore, LocalViewChanges, ReferenceSet, RemovedWrites, TargetData, TargetPurpose,
};
use crate::firestore::model::{
    DocumentKey, DocumentKeySet, DocumentMap, MutableDocument, Mutation, MutationBatchResult, SnapshotVersion,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture, RemoteSyncer};
use crate::firestore::remote::{RemoteEvent, RemoteStore, TargetChange};
use crate::platform::token::User;
use crate::util::{fail, hard_assert};

/// Receives the events the sync engine raises. Implemented by the event
/// manager.
pub trait SyncEngineListener: Send + Sync {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>);

    fn on_watch_error(&self, query: &Query, error: FirestoreError);

    fn on_online_state_change(&self, online_state: OnlineState);
}

/// Resolves once the backend accepted or rejected a write, or once every
/// write pending at registration time is done.
#[derive(Debug)]
pub struct WriteCompletion {
    receiver: Receiver<FirestoreResult<()>>,
}

impl WriteCompletion {
    fn channel() -> (Sender<FirestoreResult<()>>, Self) {
        let (sender, receiver) = async_channel::bounded(1);
        (sender, Self { receiver })
    }

    fn resolved() -> Self {
        let (sender, completion) = Self::channel();
        let _ = sender.try_send(Ok(()));
        completion
    }

    pub async fn wait(self) -> FirestoreResult<()> {
        match self.receiver.recv().await {
            Ok(result) => result,
            Err(_) => Err(cancelled("the client was terminated before the write completed")),
        }
    }
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

/// A limbo document being resolved by a dedicated single-document target.
struct LimboResolution {
    key: DocumentKey,
    /// Whether the target has reported the document. Decides which remote
    /// keys the target is expected to have.
    received_document: bool,
}

struct SyncEngineState {
    query_views: HashMap<String, QueryView>,
    queries_by_target: HashMap<TargetId, Vec<String>>,
    /// Whether each target's latest snapshot was in sync with the backend.
    target_current: HashMap<TargetId, bool>,
    /// Limbo documents waiting for a free resolution slot, oldest first.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: HashMap<TargetId, LimboResolution>,
    /// Which views hold each limbo document.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    /// Write callbacks per user key, then per batch id.
    mutation_user_callbacks: HashMap<String, BTreeMap<i32, Sender<FirestoreResult<()>>>>,
    /// `wait_for_pending_writes` callbacks, keyed by the batch they wait for.
    pending_writes_callbacks: BTreeMap<i32, Vec<Sender<FirestoreResult<()>>>>,
    current_user: User,
    online_state: OnlineState,
}

/// Reconciles local writes, acknowledgements and watch snapshots into query
/// views, and drives limbo resolution.
///
/// Every method runs on the async queue. The state lock is never held across
/// a call into the local store or the remote store.
pub struct SyncEngine {
    local_store: Arc<LocalStore>,
    remote_store: Arc<RemoteStore>,
    max_concurrent_limbo_resolutions: usize,
    listener: OnceLock<Weak<dyn SyncEngineListener>>,
    state: Mutex<SyncEngineState>,
}

impl SyncEngine {
    pub fn new(
        local_store: Arc<LocalStore>,
        remote_store: Arc<RemoteStore>,
        current_user: User,
        max_concurrent_limbo_resolutions: usize,
    ) -> Arc<Self> {
        let engine = Arc::new(Self {
            local_store,
            remote_store: Arc::clone(&remote_store),
            max_concurrent_limbo_resolutions,
            listener: OnceLock::new(),
            state: Mutex::new(SyncEngineState {
                query_views: HashMap::new(),
                queries_by_target: HashMap::new(),
                target_current: HashMap::new(),
                enqueued_limbo_resolutions: VecDeque::new(),
                active_limbo_targets_by_key: BTreeMap::new(),
                active_limbo_resolutions_by_target: HashMap::new(),
                limbo_document_refs: ReferenceSet::new(),
                limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
                mutation_user_callbacks: HashMap::new(),
                pending_writes_callbacks: BTreeMap::new(),
                current_user,
                online_state: OnlineState::Unknown,
            }),
        });
        let syncer: Weak<dyn RemoteSyncer> = Arc::downgrade(&engine) as Weak<dyn RemoteSyncer>;
        remote_store.set_syncer(syncer);
        engine
    }

    pub fn set_listener(&self, listener: Weak<dyn SyncEngineListener>) {
        hard_assert(self.listener.set(listener).is_ok(), 0x5c2e, "sync engine listener already set");
    }

    /// Starts listening to `query` and returns the initial snapshot computed
    /// from the cache.
    pub async fn listen(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let canonical_id = query.canonical_id();
        let existing = self
            .lock_state()
            .query_views
            .get(&canonical_id)
            .map(|query_view| query_view.view.compute_initial_snapshot());
        if let Some(snapshot) = existing {
            return Ok(snapshot);
        }

        let target_data = self.local_store.allocate_target(query.to_target()).await;
        let target_id = target_data.target_id;
        let current = self
            .lock_state()
            .target_current
            .get(&target_id)
            .copied()
            .unwrap_or(false);
        let snapshot = self
            .initialize_view_and_compute_snapshot(query, target_id, current, target_data.resume_token.clone())
            .await?;
        self.remote_store.listen(target_data).await?;
        Ok(snapshot)
    }

    /// Stops listening to `query`. The last query of a target releases it.
    pub async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let target_id = {
            let mut state = self.lock_state();
            let Some(target_id) = state.query_views.get(&canonical_id).map(|view| view.target_id) else {
                log::debug!("unlisten for a query that is not being listened to");
                return Ok(());
            };
            let queries = state.queries_by_target.entry(target_id).or_default();
            if queries.len() > 1 {
                queries.retain(|id| id != &canonical_id);
                state.query_views.remove(&canonical_id);
                return Ok(());
            }
            target_id
        };

        self.local_store.release_target(target_id, false).await?;
        self.remote_store.unlisten(target_id).await?;
        self.remove_and_clean_up_target(target_id, None).await
    }

    /// Queues `mutations` as one batch, raises the resulting local events and
    /// hands the batch to the remote store. The returned completion resolves
    /// when the backend answers.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<WriteCompletion> {
        let in_flight = self.remote_store.write_pipeline_batch_ids();
        if let Some(removed) = self.local_store.remove_unsynced_writes(&mutations, &in_flight).await {
            self.complete_removed_writes(&removed);
            self.emit_new_snaps_and_notify_local_store(removed.changes, None).await?;
            return Ok(WriteCompletion::resolved());
        }

        let result = self.local_store.write_locally(mutations).await?;
        let (sender, completion) = WriteCompletion::channel();
        {
            let mut state = self.lock_state();
            let user_key = state.current_user.to_key();
            state
                .mutation_user_callbacks
                .entry(user_key)
                .or_default()
                .insert(result.batch_id, sender);
        }
        self.emit_new_snaps_and_notify_local_store(result.changes, None).await?;
        self.remote_store.fill_write_pipeline().await?;
        Ok(completion)
    }

    /// Resolves once every write queued so far has been acknowledged or
    /// rejected.
    pub async fn register_pending_writes_callback(&self) -> WriteCompletion {
        if !self.remote_store.can_use_network() {
            log::debug!("the network is disabled; pending writes will not complete until it is enabled");
        }
        let highest_batch_id = self.local_store.get_highest_unacknowledged_batch_id().await;
        if highest_batch_id == BATCH_ID_UNKNOWN {
            return WriteCompletion::resolved();
        }
        let (sender, completion) = WriteCompletion::channel();
        self.lock_state()
            .pending_writes_callbacks
            .entry(highest_batch_id)
            .or_default()
            .push(sender);
        completion
    }

    /// Updates every view for the new online state and forwards it to the
    /// listener.
    pub fn apply_online_state_change(&self, online_state: OnlineState) {
        let snapshots: Vec<ViewSnapshot> = {
            let mut state = self.lock_state();
            state.online_state = online_state;
            state
                .query_views
                .values_mut()
                .filter_map(|query_view| {
                    let change = query_view.view.apply_online_state_change(online_state);
                    hard_assert(
                        change.limbo_changes.is_empty(),
                        0x2a5b,
                        "online state changes must not affect limbo documents",
                    );
                    change.snapshot
                })
                .collect()
        };
        if let Some(listener) = self.listener() {
            listener.on_online_state_change(online_state);
            listener.on_watch_change(snapshots);
        }
    }

    pub fn current_user(&self) -> User {
        self.lock_state().current_user.clone()
    }

    /// Limbo documents being resolved, with their target ids.
    pub fn active_limbo_document_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.lock_state().active_limbo_targets_by_key.clone()
    }

    /// Limbo documents waiting for a free resolution slot, oldest first.
    pub fn enqueued_limbo_document_resolutions(&self) -> Vec<DocumentKey> {
        self.lock_state().enqueued_limbo_resolutions.iter().cloned().collect()
    }

    fn listener(&self) -> Option<Arc<dyn SyncEngineListener>> {
        self.listener.get().and_then(Weak::upgrade)
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncEngineState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn initialize_view_and_compute_snapshot(
        &self,
        query: &Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let query_result = self.local_store.execute_query(query, true).await;
        let (snapshot, limbo_changes) = {
            let mut state = self.lock_state();
            let mut view = View::new(query.clone(), query_result.remote_keys);
            let doc_changes = view.compute_doc_changes(&query_result.documents, None);
            let synthesized = TargetChange::create_synthesized_target_change_for_current_change(
                current && state.online_state != OnlineState::Offline,
                resume_token,
            );
            let change = view.apply_changes(doc_changes, true, Some(&synthesized), false);
            let Some(snapshot) = change.snapshot else {
                fail(0x9c41, "a new view must produce an initial snapshot");
            };

            let canonical_id = query.canonical_id();
            state.query_views.insert(
                canonical_id.clone(),
                QueryView {
                    query: query.clone(),
                    target_id,
                    view,
                },
            );
            state.queries_by_target.entry(target_id).or_default().push(canonical_id);
            (snapshot, change.limbo_changes)
        };
        self.update_tracked_limbos(target_id, limbo_changes).await?;
        Ok(snapshot)
    }

    /// Applies `changes` to every view and raises the resulting snapshots.
    async fn emit_new_snaps_and_notify_local_store(
        &self,
        changes: DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        let canonical_ids: Vec<String> = self.lock_state().query_views.keys().cloned().collect();
        if canonical_ids.is_empty() {
            return Ok(());
        }

        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        for canonical_id in canonical_ids {
            let Some((target_id, snapshot)) = self.apply_doc_changes(&canonical_id, &changes, remote_event).await?
            else {
                continue;
            };
            if let Some(snapshot) = &snapshot {
                self.lock_state().target_current.insert(target_id, !snapshot.from_cache);
            } else if let Some(change) = remote_event.and_then(|event| event.target_changes.get(&target_id)) {
                self.lock_state().target_current.insert(target_id, change.current);
            }
            if let Some(snapshot) = snapshot {
                view_changes.push(LocalViewChanges::from_snapshot(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }

        if let Some(listener) = self.listener() {
            listener.on_watch_change(snapshots);
        }
        self.local_store.notify_local_view_changes(view_changes).await;
        Ok(())
    }

    /// Runs `changes` through one view, refilling it from the local store
    /// when a limit pushed documents out.
    async fn apply_doc_changes(
        &self,
        canonical_id: &str,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<Option<(TargetId, Option<ViewSnapshot>)>> {
        let (query, doc_changes) = {
            let state = self.lock_state();
            let Some(query_view) = state.query_views.get(canonical_id) else {
                return Ok(None);
            };
            (query_view.query.clone(), query_view.view.compute_doc_changes(changes, None))
        };

        let doc_changes = if doc_changes.needs_refill {
            let refill = self.local_store.execute_query(&query, false).await;
            let state = self.lock_state();
            let Some(query_view) = state.query_views.get(canonical_id) else {
                return Ok(None);
            };
            query_view.view.compute_doc_changes(&refill.documents, Some(doc_changes))
        } else {
            doc_changes
        };

        let (target_id, change) = {
            let mut state = self.lock_state();
            let Some(query_view) = state.query_views.get_mut(canonical_id) else {
                return Ok(None);
            };
            let target_id = query_view.target_id;
            let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
            let pending_reset = remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
            let change = query_view
                .view
                .apply_changes(doc_changes, true, target_change, pending_reset);
            (target_id, change)
        };
        self.update_tracked_limbos(target_id, change.limbo_changes).await?;
        Ok(Some((target_id, change.snapshot)))
    }

    async fn update_tracked_limbos(
        &self,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
    ) -> FirestoreResult<()> {
        for limbo_change in limbo_changes {
            match limbo_change {
                LimboDocumentChange::Added(key) => {
                    let enqueued = {
                        let mut state = self.lock_state();
                        state.limbo_document_refs.add_reference(key.clone(), target_id);
                        let tracked = state.active_limbo_targets_by_key.contains_key(&key)
                            || state.enqueued_limbo_resolutions.contains(&key);
                        if !tracked {
                            log::debug!("new document in limbo: {key}");
                            state.enqueued_limbo_resolutions.push_back(key);
                        }
                        !tracked
                    };
                    if enqueued {
                        self.pump_enqueued_limbo_resolutions().await?;
                    }
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document no longer in limbo: {key}");
                    let referenced = {
                        let mut state = self.lock_state();
                        state.limbo_document_refs.remove_reference(key.clone(), target_id);
                        state.limbo_document_refs.contains_key(&key)
                    };
                    if !referenced {
                        self.remove_limbo_target(&key).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Starts resolutions for queued limbo documents while slots are free.
    async fn pump_enqueued_limbo_resolutions(&self) -> FirestoreResult<()> {
        loop {
            let target_data = {
                let mut state = self.lock_state();
                if state.active_limbo_targets_by_key.len() >= self.max_concurrent_limbo_resolutions {
                    return Ok(());
                }
                let Some(key) = state.enqueued_limbo_resolutions.pop_front() else {
                    return Ok(());
                };
                let limbo_target_id = state.limbo_target_id_generator.next();
                state.active_limbo_resolutions_by_target.insert(
                    limbo_target_id,
                    LimboResolution {
                        key: key.clone(),
                        received_document: false,
                    },
                );
                state.active_limbo_targets_by_key.insert(key.clone(), limbo_target_id);
                TargetData::new(
                    Query::new(key.path().clone()).to_target(),
                    limbo_target_id,
                    TargetPurpose::LimboResolution,
                    INVALID_SEQUENCE_NUMBER,
                )
            };
            self.remote_store.listen(target_data).await?;
        }
    }

    async fn remove_limbo_target(&self, key: &DocumentKey) -> FirestoreResult<()> {
        let limbo_target_id = {
            let mut state = self.lock_state();
            state.enqueued_limbo_resolutions.retain(|queued| queued != key);
            let Some(limbo_target_id) = state.active_limbo_targets_by_key.remove(key) else {
                return Ok(());
            };
            state.active_limbo_resolutions_by_target.remove(&limbo_target_id);
            limbo_target_id
        };
        self.remote_store.unlisten(limbo_target_id).await?;
        self.pump_enqueued_limbo_resolutions().await
    }

    /// Drops every view of `target_id`, reporting `error` to their listeners
    /// when present, and releases the limbo documents only they referenced.
    async fn remove_and_clean_up_target(&self, target_id: TargetId, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let (queries, orphaned_limbo_keys) = {
            let mut state = self.lock_state();
            let canonical_ids = state.queries_by_target.remove(&target_id).unwrap_or_default();
            state.target_current.remove(&target_id);
            let queries: Vec<Query> = canonical_ids
                .iter()
                .filter_map(|id| state.query_views.remove(id))
                .map(|query_view| query_view.query)
                .collect();
            let limbo_keys = state.limbo_document_refs.remove_references_for_id(target_id);
            let orphaned: Vec<DocumentKey> = limbo_keys
                .into_iter()
                .filter(|key| !state.limbo_document_refs.contains_key(key))
                .collect();
            (queries, orphaned)
        };

        if let Some(error) = error {
            if let Some(listener) = self.listener() {
                for query in &queries {
                    listener.on_watch_error(query, error.clone());
                }
            }
        }
        for key in orphaned_limbo_keys {
            self.remove_limbo_target(&key).await?;
        }
        Ok(())
    }

    fn process_user_callback(&self, batch_id: i32, result: FirestoreResult<()>) {
        let sender = {
            let mut state = self.lock_state();
            let user_key = state.current_user.to_key();
            state
                .mutation_user_callbacks
                .get_mut(&user_key)
                .and_then(|callbacks| callbacks.remove(&batch_id))
        };
        if let Some(sender) = sender {
            let _ = sender.try_send(result);
        }
    }

    fn trigger_pending_writes_callbacks(&self, batch_id: i32) {
        let callbacks = self.lock_state().pending_writes_callbacks.remove(&batch_id);
        for sender in callbacks.into_iter().flatten() {
            let _ = sender.try_send(Ok(()));
        }
    }

    /// Resolves the writes of dropped batches. Pending-writes waiters on a
    /// dropped batch move to the newest batch queued before it.
    fn complete_removed_writes(&self, removed: &RemovedWrites) {
        for &batch_id in &removed.batch_ids {
            self.process_user_callback(batch_id, Ok(()));
            match removed.preceding_batch_ids.get(&batch_id) {
                Some(preceding) => {
                    let mut state = self.lock_state();
                    if let Some(callbacks) = state.pending_writes_callbacks.remove(&batch_id) {
                        state.pending_writes_callbacks.entry(*preceding).or_default().extend(callbacks);
                    }
                }
                None => self.trigger_pending_writes_callbacks(batch_id),
            }
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&self, message: &str) {
        let callbacks = std::mem::take(&mut self.lock_state().pending_writes_callbacks);
        for sender in callbacks.into_values().flatten() {
            let _ = sender.try_send(Err(cancelled(message)));
        }
    }

    async fn handle_remote_event(&self, remote_event: RemoteEvent) -> FirestoreResult<()> {
        let changes = self.local_store.apply_remote_event(remote_event.clone()).await?;

        {
            let mut state = self.lock_state();
            for (target_id, change) in &remote_event.target_changes {
                let Some(resolution) = state.active_limbo_resolutions_by_target.get_mut(target_id) else {
                    continue;
                };
                let change_count = change.added_documents.len()
                    + change.modified_documents.len()
                    + change.removed_documents.len();
                hard_assert(
                    change_count <= 1,
                    0x5858,
                    "limbo resolution for a single document contains multiple changes",
                );
                if !change.added_documents.is_empty() {
                    resolution.received_document = true;
                } else if !change.modified_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        0x390f,
                        "received a change for a limbo document that was never added",
                    );
                } else if !change.removed_documents.is_empty() {
                    hard_assert(
                        resolution.received_document,
                        0xa4f3,
                        "received a removal for a limbo document that was never added",
                    );
                    resolution.received_document = false;
                }
            }
        }

        self.emit_new_snaps_and_notify_local_store(changes, Some(&remote_event)).await
    }

    async fn handle_rejected_listen(&self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        let limbo_key = self
            .lock_state()
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());

        if let Some(limbo_key) = limbo_key {
            // The backend refused to confirm the document, so treat it as
            // deleted.
            let mut event = RemoteEvent::new(SnapshotVersion::min());
            event.document_updates = event.document_updates.insert(
                limbo_key.clone(),
                MutableDocument::new_no_document(limbo_key.clone(), SnapshotVersion::min()),
            );
            event.resolved_limbo_documents = event.resolved_limbo_documents.insert(limbo_key.clone());
            self.handle_remote_event(event).await?;

            {
                let mut state = self.lock_state();
                state.active_limbo_targets_by_key.remove(&limbo_key);
                state.active_limbo_resolutions_by_target.remove(&target_id);
            }
            return self.pump_enqueued_limbo_resolutions().await;
        }

        self.local_store.release_target(target_id, false).await?;
        self.remove_and_clean_up_target(target_id, Some(error)).await
    }

    async fn handle_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(result).await?;
        // Write callbacks fire before the listen events they cause.
        self.process_user_callback(batch_id, Ok(()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(changes, None).await
    }

    async fn handle_failed_write(&self, batch_id: i32, error: FirestoreError) -> FirestoreResult<()> {
        let changes = self.local_store.reject_batch(batch_id).await?;
        self.process_user_callback(batch_id, Err(error));
        self.trigger_pending_writes_callbacks(batch_id);
        self.emit_new_snaps_and_notify_local_store(changes, None).await
    }

    async fn handle_user_change(&self, user: User) -> FirestoreResult<()> {
        if self.lock_state().current_user == user {
            return Ok(());
        }
        log::debug!("user changed to {}", user.to_key());
        let result = self.local_store.handle_user_change(&user).await;
        self.lock_state().current_user = user;
        self.reject_outstanding_pending_writes_callbacks(
            "wait_for_pending_writes was cancelled because the user changed",
        );
        self.emit_new_snaps_and_notify_local_store(result.affected_documents, None).await
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl QueryHandler for SyncEngine {
    async fn listen(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        SyncEngine::listen(self, query).await
    }

    async fn unlisten(&self, query: &Query) -> FirestoreResult<()> {
        SyncEngine::unlisten(self, query).await
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_remote_event(event))
    }

    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_rejected_listen(target_id, error))
    }

    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_successful_write(result))
    }

    fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_failed_write(batch_id, error))
    }

    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        let state = self.lock_state();
        if let Some(resolution) = state.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return DocumentKeySet::new().insert(resolution.key.clone());
            }
            return DocumentKeySet::new();
        }
        let mut keys = DocumentKeySet::new();
        for canonical_id in state.queries_by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = state.query_views.get(canonical_id) {
                keys = keys.union_with(query_view.view.synced_documents());
            }
        }
        keys
    }

    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
        box_remote_store_future(self.handle_user_change(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::constants::DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS;
    use crate::firestore::error::permission_denied;
    use crate::firestore::local::LruParams;
    use crate::firestore::model::{DatabaseId, FieldPath, MutationResult, ObjectValue, ResourcePath, Timestamp};
    use crate::firestore::remote::stream::StreamSettings;
    use crate::firestore::remote::{InMemoryStreamingDatastore, JsonProtoSerializer};
    use crate::firestore::value::FirestoreValue;
    use crate::platform::token::EmptyTokenProvider;
    use crate::util::AsyncQueue;

    #[derive(Default)]
    struct RecordingListener {
        snapshots: Mutex<Vec<ViewSnapshot>>,
        errors: Mutex<Vec<(Query, FirestoreError)>>,
        online_states: Mutex<Vec<OnlineState>>,
    }

    impl SyncEngineListener for RecordingListener {
        fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
            self.snapshots.lock().unwrap().extend(snapshots);
        }

        fn on_watch_error(&self, query: &Query, error: FirestoreError) {
            self.errors.lock().unwrap().push((query.clone(), error));
        }

        fn on_online_state_change(&self, online_state: OnlineState) {
            self.online_states.lock().unwrap().push(online_state);
        }
    }

    struct Fixture {
        engine: Arc<SyncEngine>,
        local_store: Arc<LocalStore>,
        remote_store: Arc<RemoteStore>,
        listener: Arc<RecordingListener>,
    }

    async fn fixture(max_limbo: usize) -> Fixture {
        let queue = AsyncQueue::new();
        let local_store = Arc::new(LocalStore::new(&User::unauthenticated(), LruParams::disabled()));
        let (datastore, _server) = InMemoryStreamingDatastore::new();
        let remote_store = RemoteStore::new(
            queue,
            Arc::clone(&local_store),
            datastore,
            Arc::new(EmptyTokenProvider),
            Arc::new(EmptyTokenProvider),
            JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
            StreamSettings::default(),
            Arc::new(|_| {}),
        );
        // Keep the streams closed; the tests drive the syncer callbacks.
        remote_store.disable_network().await;
        let engine = SyncEngine::new(
            Arc::clone(&local_store),
            Arc::clone(&remote_store),
            User::unauthenticated(),
            max_limbo,
        );
        let listener = Arc::new(RecordingListener::default());
        let weak_listener: Weak<dyn SyncEngineListener> = Arc::downgrade(&listener) as Weak<dyn SyncEngineListener>;
        engine.set_listener(weak_listener);
        Fixture {
            engine,
            local_store,
            remote_store,
            listener,
        }
    }

    fn rooms() -> Query {
        Query::new(ResourcePath::from_segments(["rooms"]))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn version(seconds: i64) -> SnapshotVersion {
        SnapshotVersion::new(Timestamp::new(seconds, 0))
    }

    fn found(path: &str, seconds: i64) -> MutableDocument {
        let mut document = MutableDocument::new_found_document(key(path), version(seconds), ObjectValue::empty());
        document.set_read_time(version(seconds));
        document
    }

    fn missing(key: DocumentKey, seconds: i64) -> MutableDocument {
        let mut document = MutableDocument::new_no_document(key, version(seconds));
        document.set_read_time(version(seconds));
        document
    }

    /// Target reports `paths` as added and current.
    fn added_event(target_id: TargetId, paths: &[&str], seconds: i64) -> RemoteEvent {
        let mut event = RemoteEvent::new(version(seconds));
        let mut change = TargetChange {
            current: true,
            resume_token: b"token".to_vec(),
            ..TargetChange::default()
        };
        for path in paths {
            change.added_documents = change.added_documents.insert(key(path));
            event.document_updates = event.document_updates.insert(key(path), found(path, seconds));
        }
        event.target_changes.insert(target_id, change);
        event
    }

    /// Target stops reporting `paths` without deleting them.
    fn removed_event(target_id: TargetId, paths: &[&str], seconds: i64) -> RemoteEvent {
        let mut event = RemoteEvent::new(version(seconds));
        let mut change = TargetChange {
            current: true,
            ..TargetChange::default()
        };
        for path in paths {
            change.removed_documents = change.removed_documents.insert(key(path));
        }
        event.target_changes.insert(target_id, change);
        event
    }

    #[tokio::test]
    async fn listen_returns_cached_snapshot_and_registers_target() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS).await;
        let snapshot = fixture.engine.listen(&rooms()).await.unwrap();
        assert!(snapshot.from_cache);
        assert!(snapshot.docs.is_empty());

        let target_id = fixture.local_store.get_target_data(&rooms().to_target()).await.unwrap().target_id;
        fixture
            .engine
            .apply_remote_event(added_event(target_id, &["rooms/a"], 1))
            .await
            .unwrap();
        let snapshots = fixture.listener.snapshots.lock().unwrap().clone();
        let last = snapshots.last().unwrap();
        assert!(!last.from_cache);
        assert_eq!(last.docs.len(), 1);
        assert_eq!(
            fixture.engine.get_remote_keys_for_target(target_id),
            DocumentKeySet::new().insert(key("rooms/a"))
        );
    }

    #[tokio::test]
    async fn local_writes_raise_events_and_resolve_on_ack() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS).await;
        fixture.engine.listen(&rooms()).await.unwrap();
        let mut data = ObjectValue::empty();
        data.set(
            &FieldPath::from_dot_separated("name").unwrap(),
            FirestoreValue::from_string("eros"),
        );
        let completion = fixture
            .engine
            .write(vec![Mutation::set(key("rooms/a"), data)])
            .await
            .unwrap();
        {
            let snapshots = fixture.listener.snapshots.lock().unwrap();
            let last = snapshots.last().unwrap();
            assert_eq!(last.docs.len(), 1);
            assert!(last.has_pending_writes());
        }

        let pending = fixture.engine.register_pending_writes_callback().await;
        let batch = fixture.local_store.next_mutation_batch(None).await.unwrap();
        let result = MutationBatchResult::from(
            batch,
            version(3),
            vec![MutationResult::new(version(3), Vec::new())],
            Vec::new(),
        );
        fixture.engine.apply_successful_write(result).await.unwrap();
        completion.wait().await.unwrap();
        pending.wait().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_write_reports_error() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS).await;
        let completion = fixture.engine.write(vec![Mutation::delete(key("rooms/a"))]).await.unwrap();
        let batch = fixture.local_store.next_mutation_batch(None).await.unwrap();
        fixture
            .engine
            .reject_failed_write(batch.batch_id, permission_denied("denied"))
            .await
            .unwrap();
        let error = completion.wait().await.unwrap_err();
        assert_eq!(error.code_str(), "firestore/permission-denied");
        assert_eq!(fixture.local_store.get_highest_unacknowledged_batch_id().await, BATCH_ID_UNKNOWN);
    }

    #[tokio::test]
    async fn limbo_resolutions_respect_the_concurrency_cap() {
        let fixture = fixture(2).await;
        fixture.engine.listen(&rooms()).await.unwrap();
        let target_id = fixture.local_store.get_target_data(&rooms().to_target()).await.unwrap().target_id;
        let paths = ["rooms/a", "rooms/b", "rooms/c"];
        fixture
            .engine
            .apply_remote_event(added_event(target_id, &paths, 1))
            .await
            .unwrap();
        fixture
            .engine
            .apply_remote_event(removed_event(target_id, &paths, 2))
            .await
            .unwrap();

        let active = fixture.engine.active_limbo_document_resolutions();
        assert_eq!(active.len(), 2);
        assert!(active.values().all(|target_id| target_id % 2 == 1));
        assert_eq!(fixture.engine.enqueued_limbo_document_resolutions(), vec![key("rooms/c")]);

        // Resolving one limbo document frees a slot for the queued one.
        let (resolved_key, limbo_target) = active.iter().next().map(|(k, t)| (k.clone(), *t)).unwrap();
        let mut event = RemoteEvent::new(version(3));
        event.target_changes.insert(
            limbo_target,
            TargetChange {
                current: true,
                ..TargetChange::default()
            },
        );
        event.document_updates = event
            .document_updates
            .insert(resolved_key.clone(), missing(resolved_key.clone(), 3));
        event.resolved_limbo_documents = event.resolved_limbo_documents.insert(resolved_key.clone());
        fixture.engine.apply_remote_event(event).await.unwrap();

        let active = fixture.engine.active_limbo_document_resolutions();
        assert!(!active.contains_key(&resolved_key));
        assert!(active.contains_key(&key("rooms/c")));
        assert!(fixture.engine.enqueued_limbo_document_resolutions().is_empty());
    }

    #[tokio::test]
    async fn rejected_listen_reports_error_to_listener() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS).await;
        fixture.engine.listen(&rooms()).await.unwrap();
        let target_id = fixture.local_store.get_target_data(&rooms().to_target()).await.unwrap().target_id;
        fixture
            .engine
            .reject_listen(target_id, permission_denied("denied"))
            .await
            .unwrap();
        let errors = fixture.listener.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, rooms());
        drop(errors);
        assert!(fixture.engine.get_remote_keys_for_target(target_id).is_empty());
    }

    #[tokio::test]
    async fn going_offline_marks_views_from_cache() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS).await;
        fixture.engine.listen(&rooms()).await.unwrap();
        let target_id = fixture.local_store.get_target_data(&rooms().to_target()).await.unwrap().target_id;
        fixture
            .engine
            .apply_remote_event(added_event(target_id, &["rooms/a"], 1))
            .await
            .unwrap();

        fixture.engine.apply_online_state_change(OnlineState::Offline);
        assert_eq!(*fixture.listener.online_states.lock().unwrap(), vec![OnlineState::Offline]);
        let snapshots = fixture.listener.snapshots.lock().unwrap();
        assert!(snapshots.last().unwrap().from_cache);
        drop(snapshots);
        assert!(!fixture.remote_store.can_use_network());
    }

    #[tokio::test]
    async fn deleting_a_document_created_offline_drops_both_writes() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS).await;
        fixture.engine.listen(&rooms()).await.unwrap();
        let kept = fixture
            .engine
            .write(vec![Mutation::set(key("rooms/kept"), ObjectValue::empty())])
            .await
            .unwrap();
        let created = fixture
            .engine
            .write(vec![Mutation::set(key("rooms/ghost"), ObjectValue::empty())])
            .await
            .unwrap();
        let pending = fixture.engine.register_pending_writes_callback().await;

        let deleted = fixture
            .engine
            .write(vec![Mutation::delete(key("rooms/ghost"))])
            .await
            .unwrap();
        created.wait().await.unwrap();
        deleted.wait().await.unwrap();

        let kept_batch = fixture.local_store.next_mutation_batch(None).await.unwrap();
        assert_eq!(kept_batch.keys(), DocumentKeySet::new().insert(key("rooms/kept")));
        assert!(fixture.local_store.next_mutation_batch(Some(kept_batch.batch_id)).await.is_none());
        assert!(!fixture.local_store.read_document(&key("rooms/ghost")).await.is_valid_document());
        {
            let snapshots = fixture.listener.snapshots.lock().unwrap();
            let last = snapshots.last().unwrap();
            assert_eq!(last.docs.len(), 1);
            assert!(!last.docs.contains(&key("rooms/ghost")));
        }

        // The waiter registered behind the dropped batch now waits for the
        // batch queued before it.
        let mut pending = Box::pin(pending.wait());
        assert!(futures::FutureExt::now_or_never(pending.as_mut()).is_none());
        let result = MutationBatchResult::from(
            kept_batch,
            version(3),
            vec![MutationResult::new(version(3), Vec::new())],
            Vec::new(),
        );
        fixture.engine.apply_successful_write(result).await.unwrap();
        kept.wait().await.unwrap();
        pending.await.unwrap();
    }

    #[tokio::test]
    async fn deleting_a_document_written_with_others_is_sent() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS).await;
        fixture
            .engine
            .write(vec![
                Mutation::set(key("rooms/a"), ObjectValue::empty()),
                Mutation::set(key("rooms/b"), ObjectValue::empty()),
            ])
            .await
            .unwrap();
        fixture.engine.write(vec![Mutation::delete(key("rooms/a"))]).await.unwrap();

        let first = fixture.local_store.next_mutation_batch(None).await.unwrap();
        let second = fixture.local_store.next_mutation_batch(Some(first.batch_id)).await.unwrap();
        assert!(second.mutations[0].is_delete());
    }

    #[tokio::test]
    async fn user_change_cancels_pending_writes_callbacks() {
        let fixture = fixture(DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS).await;
        fixture.engine.write(vec![Mutation::delete(key("rooms/a"))]).await.unwrap();
        let pending = fixture.engine.register_pending_writes_callback().await;
        fixture
            .engine
            .handle_credential_change(User::new("bob"))
            .await
            .unwrap();
        assert_eq!(fixture.engine.current_user(), User::new("bob"));
        let error = pending.wait().await.unwrap_err();
        assert_eq!(error.code_str(), "firestore/cancelled");
    }
}
