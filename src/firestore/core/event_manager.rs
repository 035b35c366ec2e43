use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::SyncEngineListener;
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{FirestoreError, FirestoreResult};

pub type SnapshotObserver = Arc<dyn Fn(FirestoreResult<ViewSnapshot>) + Send + Sync>;

/// Identifies one registered listener.
pub type ListenerId = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise events for changes that only touch snapshot metadata.
    pub include_metadata_changes: bool,
    /// Hold back the first event while online until the backend has synced.
    pub wait_for_sync_when_online: bool,
}

/// The side of the engine that starts and stops watching a query.
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait QueryHandler: Send + Sync {
    async fn listen(&self, query: &Query) -> FirestoreResult<ViewSnapshot>;
    async fn unlisten(&self, query: &Query) -> FirestoreResult<()>;
}

/// Filters view snapshots down to the events one observer asked for.
pub struct QueryListener {
    id: ListenerId,
    query: Query,
    options: ListenOptions,
    observer: SnapshotObserver,
    raised_initial_event: bool,
    snap: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(id: ListenerId, query: Query, options: ListenOptions, observer: SnapshotObserver) -> Self {
        Self {
            id,
            query,
            options,
            observer,
            raised_initial_event: false,
            snap: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns the snapshot to deliver, if any.
    pub fn on_view_snapshot(&mut self, snap: ViewSnapshot) -> Option<ViewSnapshot> {
        let snap = if self.options.include_metadata_changes {
            snap
        } else {
            let mut filtered = snap;
            filtered
                .doc_changes
                .retain(|change| change.change_type != ChangeType::Metadata);
            filtered.excludes_metadata_changes = true;
            filtered
        };

        let event = if !self.raised_initial_event {
            if self.should_raise_initial_event(&snap, self.online_state) {
                Some(self.initial_event(&snap))
            } else {
                None
            }
        } else if self.should_raise_event(&snap) {
            Some(snap.clone())
        } else {
            None
        };
        self.snap = Some(snap);
        event
    }

    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> Option<ViewSnapshot> {
        self.online_state = online_state;
        let snap = self.snap.as_ref()?;
        if self.raised_initial_event || !self.should_raise_initial_event(snap, online_state) {
            return None;
        }
        let snap = snap.clone();
        Some(self.initial_event(&snap))
    }

    fn should_raise_initial_event(&self, snap: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snap.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        // Empty cached results are held back until the backend answers or
        // the client is known to be offline.
        !snap.docs.is_empty() || snap.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snap: &ViewSnapshot) -> bool {
        if !snap.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snap
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snap.has_pending_writes());
        if snap.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn initial_event(&mut self, snap: &ViewSnapshot) -> ViewSnapshot {
        self.raised_initial_event = true;
        ViewSnapshot::from_initial_documents(
            snap.query.clone(),
            snap.docs.clone(),
            snap.mutated_keys.clone(),
            snap.from_cache,
            snap.has_cached_results,
        )
    }
}

struct QueryListenersInfo {
    view_snap: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

struct EventManagerState {
    queries: HashMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

type PendingEvent = (SnapshotObserver, FirestoreResult<ViewSnapshot>);

/// Fans view snapshots out to query listeners. Several listeners on the same
/// query share one underlying listen.
pub struct EventManager {
    handler: Arc<dyn QueryHandler>,
    state: Mutex<EventManagerState>,
    next_listener_id: AtomicU64,
}

impl EventManager {
    pub fn new(handler: Arc<dyn QueryHandler>) -> Self {
        Self {
            handler,
            state: Mutex::new(EventManagerState {
                queries: HashMap::new(),
                online_state: OnlineState::Unknown,
            }),
            next_listener_id: AtomicU64::new(1),
        }
    }

    /// Registers `observer` for `query`. The first listener for a query starts
    /// the underlying listen; errors from it are reported to the observer and
    /// returned.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: SnapshotObserver,
    ) -> FirestoreResult<ListenerId> {
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let canonical_id = query.canonical_id();
        let mut listener = QueryListener::new(id, query.clone(), options, observer.clone());

        let (first_listen, events) = {
            let mut state = self.lock_state();
            let online_state = state.online_state;
            let mut events = Vec::new();
            let first_listen = !state.queries.contains_key(&canonical_id);
            let info = state.queries.entry(canonical_id.clone()).or_insert_with(|| QueryListenersInfo {
                view_snap: None,
                listeners: Vec::new(),
            });
            listener.apply_online_state_change(online_state);
            if let Some(snap) = info.view_snap.clone() {
                if let Some(event) = listener.on_view_snapshot(snap) {
                    events.push((observer.clone(), Ok(event)));
                }
            }
            info.listeners.push(listener);
            (first_listen, events)
        };
        dispatch(events);

        if first_listen {
            match self.handler.listen(&query).await {
                Ok(snap) => {
                    let events = {
                        let mut state = self.lock_state();
                        match state.queries.get_mut(&canonical_id) {
                            // A watch update may already have delivered a newer snapshot.
                            Some(info) if info.view_snap.is_none() => deliver(info, snap),
                            _ => Vec::new(),
                        }
                    };
                    dispatch(events);
                }
                Err(err) => {
                    log::warn!("listen for {canonical_id} failed: {err}");
                    let listeners = self
                        .lock_state()
                        .queries
                        .remove(&canonical_id)
                        .map(|info| info.listeners)
                        .unwrap_or_default();
                    dispatch(
                        listeners
                            .into_iter()
                            .map(|listener| (listener.observer, Err(err.clone())))
                            .collect(),
                    );
                    return Err(err);
                }
            }
        }
        Ok(id)
    }

    /// Removes a listener. The last listener for a query stops the listen.
    pub async fn unlisten(&self, query: &Query, listener_id: ListenerId) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let last_listen = {
            let mut state = self.lock_state();
            let Some(info) = state.queries.get_mut(&canonical_id) else {
                return Ok(());
            };
            info.listeners.retain(|listener| listener.id() != listener_id);
            if info.listeners.is_empty() {
                state.queries.remove(&canonical_id);
                true
            } else {
                false
            }
        };
        if last_listen {
            self.handler.unlisten(query).await?;
        }
        Ok(())
    }

    pub fn online_state(&self) -> OnlineState {
        self.lock_state().online_state
    }

    pub fn has_listeners(&self) -> bool {
        !self.lock_state().queries.is_empty()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, EventManagerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl SyncEngineListener for EventManager {
    fn on_watch_change(&self, snapshots: Vec<ViewSnapshot>) {
        let events = {
            let mut state = self.lock_state();
            let mut events = Vec::new();
            for snap in snapshots {
                if let Some(info) = state.queries.get_mut(&snap.query.canonical_id()) {
                    events.extend(deliver(info, snap));
                }
            }
            events
        };
        dispatch(events);
    }

    fn on_watch_error(&self, query: &Query, error: FirestoreError) {
        let listeners = self
            .lock_state()
            .queries
            .remove(&query.canonical_id())
            .map(|info| info.listeners)
            .unwrap_or_default();
        dispatch(
            listeners
                .into_iter()
                .map(|listener| (listener.observer, Err(error.clone())))
                .collect(),
        );
    }

    fn on_online_state_change(&self, online_state: OnlineState) {
        let events = {
            let mut state = self.lock_state();
            state.online_state = online_state;
            let mut events = Vec::new();
            for info in state.queries.values_mut() {
                for listener in info.listeners.iter_mut() {
                    if let Some(event) = listener.apply_online_state_change(online_state) {
                        events.push((listener.observer.clone(), Ok(event)));
                    }
                }
            }
            events
        };
        dispatch(events);
    }
}

fn deliver(info: &mut QueryListenersInfo, snap: ViewSnapshot) -> Vec<PendingEvent> {
    let mut events = Vec::new();
    for listener in info.listeners.iter_mut() {
        if let Some(event) = listener.on_view_snapshot(snap.clone()) {
            events.push((listener.observer.clone(), Ok(event)));
        }
    }
    info.view_snap = Some(snap);
    events
}

fn dispatch(events: Vec<PendingEvent>) {
    for (observer, event) in events {
        observer(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::document_set::DocumentSet;
    use crate::firestore::core::view_snapshot::DocumentViewChange;
    use crate::firestore::error::unavailable;
    use crate::firestore::model::{DocumentKey, DocumentKeySet, MutableDocument, ObjectValue, ResourcePath, SnapshotVersion};

    fn query() -> Query {
        Query::new(ResourcePath::from_string("rooms").unwrap())
    }

    fn doc(path: &str) -> MutableDocument {
        MutableDocument::new_found_document(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::min(),
            ObjectValue::empty(),
        )
    }

    fn snapshot(docs: &[&str], from_cache: bool) -> ViewSnapshot {
        let mut set = DocumentSet::new(query().comparator());
        for path in docs {
            set = set.insert(doc(path));
        }
        ViewSnapshot::from_initial_documents(query(), set, DocumentKeySet::new(), from_cache, false)
    }

    struct FixedHandler {
        result: FirestoreResult<ViewSnapshot>,
        unlistens: Mutex<usize>,
    }

    #[async_trait]
    impl QueryHandler for FixedHandler {
        async fn listen(&self, _query: &Query) -> FirestoreResult<ViewSnapshot> {
            self.result.clone()
        }

        async fn unlisten(&self, _query: &Query) -> FirestoreResult<()> {
            *self.unlistens.lock().unwrap() += 1;
            Ok(())
        }
    }

    fn recorder() -> (SnapshotObserver, Arc<Mutex<Vec<FirestoreResult<ViewSnapshot>>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let observer: SnapshotObserver = Arc::new(move |event| sink.lock().unwrap().push(event));
        (observer, events)
    }

    fn manager(result: FirestoreResult<ViewSnapshot>) -> (EventManager, Arc<FixedHandler>) {
        let handler = Arc::new(FixedHandler {
            result,
            unlistens: Mutex::new(0),
        });
        (EventManager::new(handler.clone()), handler)
    }

    #[tokio::test]
    async fn raises_initial_event_for_synced_snapshot() {
        let (manager, _) = manager(Ok(snapshot(&["rooms/a"], false)));
        let (observer, events) = recorder();
        manager.listen(query(), ListenOptions::default(), observer).await.unwrap();
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        let snap = events[0].as_ref().unwrap();
        assert_eq!(snap.docs.len(), 1);
        assert!(!snap.from_cache);
    }

    #[tokio::test]
    async fn holds_back_empty_cached_snapshot_until_offline() {
        let (manager, _) = manager(Ok(snapshot(&[], true)));
        let (observer, events) = recorder();
        manager.listen(query(), ListenOptions::default(), observer).await.unwrap();
        assert!(events.lock().unwrap().is_empty());

        manager.on_online_state_change(OnlineState::Offline);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn second_listener_shares_the_listen() {
        let (manager, handler) = manager(Ok(snapshot(&["rooms/a"], false)));
        let (first, first_events) = recorder();
        let (second, second_events) = recorder();
        let first_id = manager.listen(query(), ListenOptions::default(), first).await.unwrap();
        let second_id = manager.listen(query(), ListenOptions::default(), second).await.unwrap();
        assert_eq!(first_events.lock().unwrap().len(), 1);
        assert_eq!(second_events.lock().unwrap().len(), 1);

        manager.unlisten(&query(), first_id).await.unwrap();
        assert_eq!(*handler.unlistens.lock().unwrap(), 0);
        manager.unlisten(&query(), second_id).await.unwrap();
        assert_eq!(*handler.unlistens.lock().unwrap(), 1);
        assert!(!manager.has_listeners());
    }

    #[tokio::test]
    async fn metadata_only_changes_need_opt_in() {
        let (manager, _) = manager(Ok(snapshot(&["rooms/a"], false)));
        let (plain, plain_events) = recorder();
        let (with_metadata, metadata_events) = recorder();
        manager.listen(query(), ListenOptions::default(), plain).await.unwrap();
        manager
            .listen(
                query(),
                ListenOptions {
                    include_metadata_changes: true,
                    ..Default::default()
                },
                with_metadata,
            )
            .await
            .unwrap();

        let mut update = snapshot(&["rooms/a"], true);
        update.doc_changes = vec![DocumentViewChange::new(ChangeType::Metadata, doc("rooms/a"))];
        update.sync_state_changed = true;
        manager.on_watch_change(vec![update]);

        assert_eq!(plain_events.lock().unwrap().len(), 1);
        let metadata_events = metadata_events.lock().unwrap();
        assert_eq!(metadata_events.len(), 2);
        assert!(metadata_events[1].as_ref().unwrap().from_cache);
    }

    #[tokio::test]
    async fn listen_failure_reaches_observer() {
        let (manager, _) = manager(Err(unavailable("offline")));
        let (observer, events) = recorder();
        assert!(manager.listen(query(), ListenOptions::default(), observer).await.is_err());
        assert!(events.lock().unwrap()[0].is_err());
        assert!(!manager.has_listeners());
    }

    #[tokio::test]
    async fn watch_error_removes_listeners() {
        let (manager, _) = manager(Ok(snapshot(&[], false)));
        let (observer, events) = recorder();
        manager.listen(query(), ListenOptions::default(), observer).await.unwrap();
        manager.on_watch_error(&query(), unavailable("gone"));
        assert!(events.lock().unwrap().last().unwrap().is_err());
        assert!(!manager.has_listeners());
    }
}
