use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use crate::firestore::constants::MAX_PENDING_WRITES;
use crate::firestore::core::target::TargetId;
use crate::firestore::core::types::OnlineState;
use crate::firestore::error::{
    internal_error, is_permanent_error, is_permanent_write_error, FirestoreError, FirestoreResult,
};
use crate::firestore::local::{LocalStore, TargetData};
use crate::firestore::model::{
    DocumentKeySet, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::datastore::{box_stream_future, StreamingDatastore, StreamingFuture, TokenProviderArc};
use crate::firestore::remote::online_state_tracker::{OnlineStateHandler, OnlineStateTracker};
use crate::firestore::remote::remote_syncer::RemoteSyncer;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::StreamSettings;
use crate::firestore::remote::streams::{WatchStream, WatchStreamListener, WriteStream, WriteStreamListener};
use crate::firestore::remote::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::platform::token::User;
use crate::util::{box_queue_future, fail, hard_assert, AsyncQueue, TimerId};

const LOCAL_STORE_RECOVERY_DELAY: Duration = Duration::from_secs(1);

/// Reasons the remote store keeps the network disabled. The network is used
/// only while the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
enum OfflineCause {
    UserDisabled,
    LocalStorageFailure,
    CredentialChange,
    Shutdown,
}

#[derive(Default)]
struct RemoteStoreState {
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
}

/// Answers the aggregator's questions from the store's listen targets and the
/// sync engine's view of remote keys.
struct ListenTargetMetadata {
    store: Weak<RemoteStore>,
}

impl TargetMetadataProvider for ListenTargetMetadata {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.store
            .upgrade()
            .map(|store| store.remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.store
            .upgrade()
            .and_then(|store| store.lock_listen_targets().get(&target_id).cloned())
    }
}

/// Owns the watch and write streams and keeps them in line with the targets
/// the sync engine listens to and the batches waiting in the mutation queue.
///
/// Every method must run on the async queue.
pub struct RemoteStore {
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    database_id: crate::firestore::model::DatabaseId,
    watch_stream: Arc<WatchStream>,
    write_stream: Arc<WriteStream>,
    online_state_tracker: Arc<OnlineStateTracker>,
    metadata: Arc<dyn TargetMetadataProvider>,
    syncer: OnceLock<Weak<dyn RemoteSyncer>>,
    weak_self: Weak<RemoteStore>,
    /// Targets the sync engine listens to, sent again whenever the watch
    /// stream reconnects.
    listen_targets: Mutex<HashMap<TargetId, TargetData>>,
    /// Present only while the watch stream is started.
    aggregator: Mutex<Option<WatchChangeAggregator>>,
    state: Mutex<RemoteStoreState>,
}

impl RemoteStore {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        datastore: Arc<dyn StreamingDatastore>,
        auth_provider: TokenProviderArc,
        app_check_provider: TokenProviderArc,
        serializer: JsonProtoSerializer,
        settings: StreamSettings,
        online_state_handler: OnlineStateHandler,
    ) -> Arc<Self> {
        let online_state_timeout = settings.online_state_timeout;
        Arc::new_cyclic(|weak: &Weak<RemoteStore>| {
            let watch_listener: Weak<dyn WatchStreamListener> = weak.clone();
            let write_listener: Weak<dyn WriteStreamListener> = weak.clone();
            let watch_stream = WatchStream::new(
                queue.clone(),
                Arc::clone(&datastore),
                Arc::clone(&auth_provider),
                Arc::clone(&app_check_provider),
                serializer.clone(),
                settings.clone(),
                watch_listener,
            );
            let write_stream = WriteStream::new(
                queue.clone(),
                datastore,
                auth_provider,
                app_check_provider,
                serializer.clone(),
                settings,
                write_listener,
            );
            Self {
                online_state_tracker: OnlineStateTracker::with_timeout(
                    queue.clone(),
                    online_state_handler,
                    online_state_timeout,
                ),
                queue,
                local_store,
                database_id: serializer.database_id().clone(),
                watch_stream,
                write_stream,
                metadata: Arc::new(ListenTargetMetadata { store: weak.clone() }),
                syncer: OnceLock::new(),
                weak_self: weak.clone(),
                listen_targets: Mutex::new(HashMap::new()),
                aggregator: Mutex::new(None),
                state: Mutex::new(RemoteStoreState::default()),
            }
        })
    }

    /// Connects the store to the sync engine. Must be called once, before
    /// `start`.
    pub fn set_syncer(&self, syncer: Weak<dyn RemoteSyncer>) {
        hard_assert(self.syncer.set(syncer).is_ok(), 0x3a91, "remote syncer already set");
    }

    pub async fn start(&self) -> FirestoreResult<()> {
        self.enable_network().await
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    pub fn can_use_network(&self) -> bool {
        self.lock_state().offline_causes.is_empty()
    }

    /// Re-enables the network after `disable_network`.
    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.lock_state().offline_causes.remove(&OfflineCause::UserDisabled);
        self.enable_network_internal().await
    }

    /// Closes both streams and reports `Offline` until `enable_network`.
    /// Outstanding writes stay in the mutation queue.
    pub async fn disable_network(&self) {
        self.lock_state().offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Offline);
    }

    pub async fn shutdown(&self) {
        log::debug!("remote store shutting down");
        self.lock_state().offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal().await;
        self.online_state_tracker.shutdown();
        self.online_state_tracker.set(OnlineState::Unknown);
        self.watch_stream.shutdown().await;
        self.write_stream.shutdown().await;
    }

    /// Starts watching `target_data`. Listening to an already watched target
    /// is a no-op.
    pub async fn listen(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        {
            let mut targets = self.lock_listen_targets();
            if targets.contains_key(&target_id) {
                return Ok(());
            }
            targets.insert(target_id, target_data.clone());
        }

        if self.should_start_watch_stream() {
            self.start_watch_stream();
        } else if self.watch_stream.is_open() {
            self.send_watch_request(target_data).await?;
        }
        Ok(())
    }

    pub async fn unlisten(&self, target_id: TargetId) -> FirestoreResult<()> {
        let removed = self.lock_listen_targets().remove(&target_id);
        hard_assert(
            removed.is_some(),
            0x0a03,
            format!("unlistening target {target_id} that is not being listened to"),
        );

        if self.watch_stream.is_open() {
            self.send_unwatch_request(target_id).await?;
        }

        if self.lock_listen_targets().is_empty() {
            if self.watch_stream.is_open() {
                self.watch_stream.mark_idle();
            } else if self.can_use_network() {
                // Nothing is connecting any more, so the state is unknown.
                self.online_state_tracker.set(OnlineState::Unknown);
            }
        }
        Ok(())
    }

    /// Pulls batches from the mutation queue until the pipeline is full and
    /// sends them once the write stream is ready.
    pub async fn fill_write_pipeline(&self) -> FirestoreResult<()> {
        let mut last_batch_id = self
            .lock_state()
            .write_pipeline
            .back()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN);

        while self.can_add_to_write_pipeline() {
            let Some(batch) = self.local_store.next_mutation_batch(Some(last_batch_id)).await else {
                if self.lock_state().write_pipeline.is_empty() {
                    self.write_stream.mark_idle();
                }
                break;
            };
            last_batch_id = batch.batch_id;
            self.add_to_write_pipeline(batch).await?;
        }

        if self.should_start_write_stream() {
            self.start_write_stream();
        }
        Ok(())
    }

    /// Restarts both streams so they pick up `user`'s credentials, letting the
    /// sync engine switch its local state while the network is down.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        log::debug!("remote store received new credentials");
        let uses_network = self.can_use_network();
        self.lock_state().offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal().await;
        if uses_network {
            self.online_state_tracker.set(OnlineState::Unknown);
        }

        let result = match self.syncer() {
            Ok(syncer) => syncer.handle_credential_change(user).await,
            Err(err) => Err(err),
        };

        self.lock_state().offline_causes.remove(&OfflineCause::CredentialChange);
        self.enable_network_internal().await?;
        result
    }

    pub fn write_pipeline_len(&self) -> usize {
        self.lock_state().write_pipeline.len()
    }

    /// Batches handed to the write stream and not yet acknowledged.
    pub fn write_pipeline_batch_ids(&self) -> BTreeSet<i32> {
        self.lock_state().write_pipeline.iter().map(|batch| batch.batch_id).collect()
    }

    fn syncer(&self) -> FirestoreResult<Arc<dyn RemoteSyncer>> {
        self.syncer
            .get()
            .and_then(Weak::upgrade)
            .ok_or_else(|| internal_error("remote store has no syncer"))
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        self.syncer
            .get()
            .and_then(Weak::upgrade)
            .map(|syncer| syncer.get_remote_keys_for_target(target_id))
            .unwrap_or_default()
    }

    fn lock_state(&self) -> MutexGuard<'_, RemoteStoreState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_listen_targets(&self) -> MutexGuard<'_, HashMap<TargetId, TargetData>> {
        match self.listen_targets.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn with_aggregator<T>(&self, operation: impl FnOnce(&mut WatchChangeAggregator) -> T) -> Option<T> {
        let mut guard = match self.aggregator.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.as_mut().map(operation)
    }

    async fn enable_network_internal(&self) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }

        if !self.watch_stream.is_started() {
            self.watch_stream.inhibit_backoff();
            if self.should_start_watch_stream() {
                self.start_watch_stream();
            } else {
                self.online_state_tracker.set(OnlineState::Unknown);
            }
        }

        if !self.write_stream.is_started() {
            self.write_stream.inhibit_backoff();
        }
        self.fill_write_pipeline().await
    }

    async fn disable_network_internal(&self) {
        self.watch_stream.stop().await;
        self.clean_up_watch_stream_state();

        self.write_stream.stop().await;
        let dropped = {
            let mut state = self.lock_state();
            let dropped = state.write_pipeline.len();
            state.write_pipeline.clear();
            dropped
        };
        if dropped > 0 {
            log::debug!("stopping write stream with {dropped} pending writes");
        }
    }

    /// Keeps the network off until the local store is usable again.
    async fn disable_network_until_recovery(&self, error: FirestoreError) {
        log::warn!("local store failure, disabling network until it recovers: {error}");
        self.lock_state().offline_causes.insert(OfflineCause::LocalStorageFailure);
        self.disable_network_internal().await;
        self.online_state_tracker.set(OnlineState::Offline);

        let weak = self.weak_self.clone();
        self.queue
            .enqueue_after_delay(TimerId::AsyncQueueRetry, LOCAL_STORE_RECOVERY_DELAY, move || {
                box_queue_future(async move {
                    if let Some(store) = weak.upgrade() {
                        store.recover_local_storage().await;
                    }
                })
            });
    }

    async fn recover_local_storage(&self) {
        // A successful read shows the local store is usable again.
        let _ = self.local_store.get_last_remote_snapshot_version().await;
        log::debug!("local store recovered, re-enabling network");
        self.lock_state().offline_causes.remove(&OfflineCause::LocalStorageFailure);
        if let Err(err) = self.enable_network_internal().await {
            log::warn!("failed to re-enable network: {err}");
        }
    }

    async fn recover_from(&self, result: FirestoreResult<()>) -> FirestoreResult<()> {
        match result {
            Err(error) if error.is_local_storage_failure() => {
                self.disable_network_until_recovery(error).await;
                Ok(())
            }
            other => other,
        }
    }

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.watch_stream.is_started() && !self.lock_listen_targets().is_empty()
    }

    fn start_watch_stream(&self) {
        hard_assert(
            self.should_start_watch_stream(),
            0x1e56,
            "start_watch_stream called when the stream should not start",
        );
        let aggregator = WatchChangeAggregator::new(Arc::clone(&self.metadata), self.database_id.clone());
        match self.aggregator.lock() {
            Ok(mut guard) => *guard = Some(aggregator),
            Err(poisoned) => *poisoned.into_inner() = Some(aggregator),
        }
        self.watch_stream.start();
        self.online_state_tracker.handle_watch_stream_start();
    }

    fn clean_up_watch_stream_state(&self) {
        match self.aggregator.lock() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    /// Registers `target_data` with the backend. A resumed target carries the
    /// number of documents it is expected to match so the backend can send an
    /// existence filter.
    async fn send_watch_request(&self, target_data: TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        self.with_aggregator(|aggregator| aggregator.record_pending_target_request(target_id));

        let target_data = if !target_data.resume_token.is_empty() || target_data.snapshot_version > SnapshotVersion::min()
        {
            let expected_count = self.remote_keys_for_target(target_id).len() as i32;
            target_data.with_expected_count(expected_count)
        } else {
            target_data
        };
        self.watch_stream.watch(&target_data).await
    }

    async fn send_unwatch_request(&self, target_id: TargetId) -> FirestoreResult<()> {
        self.with_aggregator(|aggregator| aggregator.record_pending_target_request(target_id));
        self.watch_stream.unwatch(target_id).await
    }

    async fn handle_watch_change(&self, change: WatchChange, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        // Any message from the backend proves it is reachable.
        self.online_state_tracker.set(OnlineState::Online);

        match change {
            WatchChange::TargetChange(change)
                if change.state == WatchTargetChangeState::Removed && change.cause.is_some() =>
            {
                return self.handle_target_error(change).await;
            }
            WatchChange::TargetChange(change) => {
                self.with_aggregator(|aggregator| aggregator.handle_target_change(&change));
            }
            WatchChange::DocumentChange(change) => {
                self.with_aggregator(|aggregator| aggregator.handle_document_change(change));
            }
            WatchChange::ExistenceFilter(change) => {
                self.with_aggregator(|aggregator| aggregator.handle_existence_filter(&change));
            }
        }

        if snapshot_version != SnapshotVersion::min() {
            let last_remote_snapshot_version = self.local_store.get_last_remote_snapshot_version().await;
            if snapshot_version >= last_remote_snapshot_version {
                self.raise_watch_snapshot(snapshot_version).await?;
            }
        }
        Ok(())
    }

    /// Builds a remote event from the aggregated changes, records new resume
    /// tokens and re-listens to targets whose existence filter mismatched.
    async fn raise_watch_snapshot(&self, snapshot_version: SnapshotVersion) -> FirestoreResult<()> {
        hard_assert(
            snapshot_version != SnapshotVersion::min(),
            0x82b7,
            "cannot raise a snapshot without a version",
        );
        let Some(remote_event) = self.with_aggregator(|aggregator| aggregator.create_remote_event(snapshot_version))
        else {
            return Ok(());
        };

        let mut relistens = Vec::new();
        {
            let mut targets = self.lock_listen_targets();
            for (target_id, change) in &remote_event.target_changes {
                if change.resume_token.is_empty() {
                    continue;
                }
                if let Some(target_data) = targets.get_mut(target_id) {
                    *target_data = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                }
            }

            for (target_id, purpose) in &remote_event.target_mismatches {
                let Some(target_data) = targets.get_mut(target_id) else {
                    continue;
                };
                // Without a resume token the backend sends the full result set.
                *target_data = target_data.with_resume_token(Vec::new(), target_data.snapshot_version);
                relistens.push(TargetData::new(
                    target_data.target.clone(),
                    *target_id,
                    *purpose,
                    target_data.sequence_number,
                ));
            }
        }

        for request in relistens {
            self.send_unwatch_request(request.target_id).await?;
            self.send_watch_request(request).await?;
        }

        self.syncer()?.apply_remote_event(remote_event).await
    }

    async fn handle_target_error(&self, change: WatchTargetChange) -> FirestoreResult<()> {
        let Some(error) = change.cause else {
            return Ok(());
        };
        for target_id in change.target_ids {
            if !self.lock_listen_targets().contains_key(&target_id) {
                continue;
            }
            log::debug!("target {target_id} rejected by the backend: {error}");
            self.syncer()?.reject_listen(target_id, error.clone()).await?;
            self.lock_listen_targets().remove(&target_id);
            self.with_aggregator(|aggregator| aggregator.remove_target(target_id));
        }
        Ok(())
    }

    async fn handle_watch_stream_close(&self, error: Option<FirestoreError>) {
        self.clean_up_watch_stream_state();
        if self.should_start_watch_stream() {
            match &error {
                Some(error) => self.online_state_tracker.handle_watch_stream_failure(error),
                None => log::debug!("watch stream closed cleanly with active targets, restarting"),
            }
            self.start_watch_stream();
        } else {
            // No targets or no network: nobody is trying to connect.
            self.online_state_tracker.set(OnlineState::Unknown);
        }
    }

    fn can_add_to_write_pipeline(&self) -> bool {
        let state = self.lock_state();
        state.offline_causes.is_empty() && state.write_pipeline.len() < MAX_PENDING_WRITES
    }

    async fn add_to_write_pipeline(&self, batch: MutationBatch) -> FirestoreResult<()> {
        hard_assert(
            self.can_add_to_write_pipeline(),
            0x2f1c,
            "add_to_write_pipeline called when the pipeline is full",
        );
        let mutations = batch.mutations.clone();
        self.lock_state().write_pipeline.push_back(batch);
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(&mutations).await?;
        }
        Ok(())
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.lock_state().write_pipeline.is_empty()
    }

    fn start_write_stream(&self) {
        hard_assert(
            self.should_start_write_stream(),
            0x7a3e,
            "start_write_stream called when the stream should not start",
        );
        self.write_stream.start();
    }

    async fn send_pending_writes(&self) -> FirestoreResult<()> {
        let batches: Vec<_> = self
            .lock_state()
            .write_pipeline
            .iter()
            .map(|batch| batch.mutations.clone())
            .collect();
        for mutations in batches {
            self.write_stream.write_mutations(&mutations).await?;
        }
        Ok(())
    }

    async fn handle_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> FirestoreResult<()> {
        let Some(batch) = self.lock_state().write_pipeline.pop_front() else {
            fail(0xa95e, "received a write result with an empty pipeline");
        };
        let result = MutationBatchResult::from(batch, commit_version, results, self.write_stream.last_stream_token());
        self.syncer()?.apply_successful_write(result).await?;
        self.fill_write_pipeline().await
    }

    async fn handle_write_stream_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let Some(error) = error else {
            return Ok(());
        };
        if self.lock_state().write_pipeline.is_empty() {
            return Ok(());
        }

        if self.write_stream.handshake_complete() {
            self.handle_write_error(error).await?;
        } else {
            self.handle_handshake_error(error).await;
        }

        if self.should_start_write_stream() {
            self.start_write_stream();
        }
        Ok(())
    }

    async fn handle_handshake_error(&self, error: FirestoreError) {
        if is_permanent_error(error.code) {
            log::debug!("write stream handshake failed permanently, resetting stream token: {error}");
            self.write_stream.set_last_stream_token(Vec::new());
            self.local_store.set_last_stream_token(Vec::new()).await;
        }
    }

    /// A permanent failure rejects the batch at the head of the pipeline.
    /// Anything else is retried when the stream reconnects.
    async fn handle_write_error(&self, error: FirestoreError) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let Some(batch) = self.lock_state().write_pipeline.pop_front() else {
            fail(0x1c0a, "write error with an empty pipeline");
        };
        // The failure is the batch's fault, so reconnect right away.
        self.write_stream.inhibit_backoff();
        self.syncer()?.reject_failed_write(batch.batch_id, error).await?;
        self.fill_write_pipeline().await
    }
}

impl WatchStreamListener for RemoteStore {
    fn on_watch_stream_open(&self) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            let targets: Vec<TargetData> = self.lock_listen_targets().values().cloned().collect();
            for target_data in targets {
                if let Err(err) = self.send_watch_request(target_data).await {
                    log::debug!("failed to send watch request: {err}");
                }
            }
        })
    }

    fn on_watch_change(
        &self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
    ) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            let result = self.handle_watch_change(change, snapshot_version).await;
            self.recover_from(result).await
        })
    }

    fn on_watch_stream_close(&self, error: Option<FirestoreError>) -> StreamingFuture<'_, ()> {
        box_stream_future(self.handle_watch_stream_close(error))
    }
}

impl WriteStreamListener for RemoteStore {
    fn on_write_stream_open(&self) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            if let Err(err) = self.write_stream.write_handshake().await {
                log::debug!("failed to send write handshake: {err}");
            }
        })
    }

    fn on_write_handshake_complete(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(self.send_pending_writes())
    }

    fn on_mutation_result(
        &self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
    ) -> StreamingFuture<'_, FirestoreResult<()>> {
        box_stream_future(async move {
            let result = self.handle_mutation_result(commit_version, results).await;
            self.recover_from(result).await
        })
    }

    fn on_write_stream_close(&self, error: Option<FirestoreError>) -> StreamingFuture<'_, ()> {
        box_stream_future(async move {
            let result = self.handle_write_stream_close(error).await;
            if let Err(err) = self.recover_from(result).await {
                log::warn!("failed to handle write stream close: {err}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::{LruParams, TargetPurpose};
    use crate::firestore::model::{DatabaseId, DocumentKey, Mutation, ResourcePath};
    use crate::firestore::remote::datastore::{InMemoryStreamingDatastore, ServerStream, StreamKind};
    use crate::firestore::remote::remote_event::RemoteEvent;
    use crate::firestore::remote::remote_syncer::{box_remote_store_future, RemoteStoreFuture};
    use crate::platform::runtime;
    use crate::platform::token::EmptyTokenProvider;
    use async_channel::Receiver;
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSyncer {
        events: Mutex<Vec<RemoteEvent>>,
        rejected_listens: Mutex<Vec<TargetId>>,
        acknowledged: Mutex<Vec<i32>>,
        rejected_writes: Mutex<Vec<(i32, FirestoreError)>>,
        /// Acknowledged batches are removed here, as the sync engine does.
        local_store: Option<Arc<LocalStore>>,
    }

    impl RemoteSyncer for RecordingSyncer {
        fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.events.lock().unwrap().push(event);
                Ok(())
            })
        }

        fn reject_listen(&self, target_id: TargetId, _error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.rejected_listens.lock().unwrap().push(target_id);
                Ok(())
            })
        }

        fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                let batch_id = result.batch.batch_id;
                if let Some(local_store) = &self.local_store {
                    local_store.acknowledge_batch(result).await?;
                }
                self.acknowledged.lock().unwrap().push(batch_id);
                Ok(())
            })
        }

        fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async move {
                self.rejected_writes.lock().unwrap().push((batch_id, error));
                Ok(())
            })
        }

        fn get_remote_keys_for_target(&self, _target_id: TargetId) -> DocumentKeySet {
            DocumentKeySet::new()
        }

        fn handle_credential_change(&self, _user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>> {
            box_remote_store_future(async { Ok(()) })
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        local_store: Arc<LocalStore>,
        store: Arc<RemoteStore>,
        syncer: Arc<RecordingSyncer>,
        server: Receiver<ServerStream>,
        online_states: Arc<Mutex<Vec<OnlineState>>>,
    }

    impl Fixture {
        async fn run<F, T>(&self, operation: F) -> T
        where
            F: std::future::Future<Output = T>,
        {
            self.queue.enqueue(operation).await.unwrap()
        }

        async fn next_stream(&self, kind: StreamKind) -> ServerStream {
            let stream = self.server.recv().await.unwrap();
            assert_eq!(stream.kind, kind);
            stream
        }
    }

    fn fixture() -> Fixture {
        let queue = AsyncQueue::new();
        let local_store = Arc::new(LocalStore::new(&User::unauthenticated(), LruParams::disabled()));
        let (datastore, server) = InMemoryStreamingDatastore::new();
        let online_states = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&online_states);
        let store = RemoteStore::new(
            queue.clone(),
            Arc::clone(&local_store),
            datastore,
            Arc::new(EmptyTokenProvider),
            Arc::new(EmptyTokenProvider),
            JsonProtoSerializer::new(DatabaseId::new("p", "(default)")),
            StreamSettings::default(),
            Arc::new(move |state| sink.lock().unwrap().push(state)),
        );
        let syncer = Arc::new(RecordingSyncer {
            local_store: Some(Arc::clone(&local_store)),
            ..RecordingSyncer::default()
        });
        let weak_syncer: Weak<dyn RemoteSyncer> = Arc::downgrade(&syncer) as Weak<dyn RemoteSyncer>;
        store.set_syncer(weak_syncer);
        Fixture {
            queue,
            local_store,
            store,
            syncer,
            server,
            online_states,
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

    fn target_data(target_id: TargetId) -> TargetData {
        let query = Query::new(ResourcePath::from_segments(["rooms"]));
        TargetData::new(query.to_target(), target_id, TargetPurpose::Listen, 1)
    }

    #[tokio::test]
    async fn listen_opens_watch_stream_and_raises_events() {
        let fixture = fixture();
        fixture.run(fixture.store.start()).await.unwrap();
        fixture.run(fixture.store.listen(target_data(2))).await.unwrap();

        let watch = fixture.next_stream(StreamKind::Listen).await;
        let request = watch.stream.next_message().await.unwrap().unwrap();
        assert_eq!(request["addTarget"]["targetId"], 2);

        for message in [
            json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }),
            json!({ "targetChange": {
                "targetChangeType": "CURRENT",
                "targetIds": [2],
                "resumeToken": BASE64_STANDARD.encode(b"resume"),
            } }),
            json!({ "targetChange": { "targetChangeType": "NO_CHANGE", "readTime": "2024-01-01T00:00:00Z" } }),
        ] {
            watch.stream.send_message(message).await.unwrap();
        }

        let syncer = Arc::clone(&fixture.syncer);
        wait_until(move || syncer.events.lock().unwrap().len() == 1).await;
        let event = fixture.syncer.events.lock().unwrap()[0].clone();
        assert!(event.target_changes[&2].current);
        assert_eq!(fixture.store.online_state(), OnlineState::Online);
        let stored = fixture.store.lock_listen_targets()[&2].clone();
        assert_eq!(stored.resume_token, b"resume".to_vec());
    }

    #[tokio::test]
    async fn rejected_target_is_reported_and_forgotten() {
        let fixture = fixture();
        fixture.run(fixture.store.start()).await.unwrap();
        fixture.run(fixture.store.listen(target_data(4))).await.unwrap();
        let watch = fixture.next_stream(StreamKind::Listen).await;
        let _ = watch.stream.next_message().await;

        watch
            .stream
            .send_message(json!({ "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [4],
                "cause": { "code": 7, "message": "denied" },
            } }))
            .await
            .unwrap();

        let syncer = Arc::clone(&fixture.syncer);
        wait_until(move || !syncer.rejected_listens.lock().unwrap().is_empty()).await;
        assert_eq!(*fixture.syncer.rejected_listens.lock().unwrap(), vec![4]);
        assert!(fixture.store.lock_listen_targets().is_empty());
    }

    #[tokio::test]
    async fn watch_failure_reports_offline() {
        let fixture = fixture();
        fixture.run(fixture.store.start()).await.unwrap();
        fixture.run(fixture.store.listen(target_data(2))).await.unwrap();
        let watch = fixture.next_stream(StreamKind::Listen).await;

        watch.stream.fail(crate::firestore::error::unavailable("network down")).await;
        let store = Arc::clone(&fixture.store);
        wait_until(move || store.online_state() == OnlineState::Offline).await;
        assert_eq!(fixture.online_states.lock().unwrap().last(), Some(&OnlineState::Offline));
    }

    #[tokio::test]
    async fn write_pipeline_sends_after_handshake_and_acknowledges() {
        let fixture = fixture();
        fixture.run(fixture.store.start()).await.unwrap();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let written = fixture
            .local_store
            .write_locally(vec![Mutation::delete(key)])
            .await
            .unwrap();
        fixture.run(fixture.store.fill_write_pipeline()).await.unwrap();
        assert_eq!(fixture.store.write_pipeline_len(), 1);

        let write = fixture.next_stream(StreamKind::Write).await;
        let handshake = write.stream.next_message().await.unwrap().unwrap();
        assert!(handshake.get("writes").is_none());
        write
            .stream
            .send_message(json!({ "streamToken": BASE64_STANDARD.encode(b"t1") }))
            .await
            .unwrap();

        let request = write.stream.next_message().await.unwrap().unwrap();
        assert_eq!(request["writes"].as_array().map(Vec::len), Some(1));
        write
            .stream
            .send_message(json!({
                "streamToken": BASE64_STANDARD.encode(b"t2"),
                "commitTime": "2024-01-01T00:00:05Z",
                "writeResults": [{}],
            }))
            .await
            .unwrap();

        let syncer = Arc::clone(&fixture.syncer);
        wait_until(move || !syncer.acknowledged.lock().unwrap().is_empty()).await;
        assert_eq!(*fixture.syncer.acknowledged.lock().unwrap(), vec![written.batch_id]);
        assert_eq!(fixture.store.write_pipeline_len(), 0);
    }

    #[tokio::test]
    async fn permanent_write_error_rejects_the_batch() {
        let fixture = fixture();
        fixture.run(fixture.store.start()).await.unwrap();
        let key = DocumentKey::from_string("rooms/a").unwrap();
        let written = fixture
            .local_store
            .write_locally(vec![Mutation::delete(key)])
            .await
            .unwrap();
        fixture.run(fixture.store.fill_write_pipeline()).await.unwrap();

        let write = fixture.next_stream(StreamKind::Write).await;
        let _ = write.stream.next_message().await;
        write
            .stream
            .send_message(json!({ "streamToken": BASE64_STANDARD.encode(b"t1") }))
            .await
            .unwrap();
        let _ = write.stream.next_message().await;
        write
            .stream
            .fail(crate::firestore::error::permission_denied("no access"))
            .await;

        let syncer = Arc::clone(&fixture.syncer);
        wait_until(move || !syncer.rejected_writes.lock().unwrap().is_empty()).await;
        let (batch_id, error) = fixture.syncer.rejected_writes.lock().unwrap()[0].clone();
        assert_eq!(batch_id, written.batch_id);
        assert_eq!(error.code_str(), "firestore/permission-denied");
    }

    #[tokio::test]
    async fn disable_network_goes_offline_and_enable_reconnects() {
        let fixture = fixture();
        fixture.run(fixture.store.start()).await.unwrap();
        fixture.run(fixture.store.listen(target_data(2))).await.unwrap();
        let first = fixture.next_stream(StreamKind::Listen).await;
        let _ = first.stream.next_message().await;

        fixture.run(fixture.store.disable_network()).await;
        assert_eq!(fixture.store.online_state(), OnlineState::Offline);
        assert!(!fixture.store.can_use_network());
        assert!(first.stream.next_message().await.is_none());

        fixture.run(fixture.store.enable_network()).await.unwrap();
        let second = fixture.next_stream(StreamKind::Listen).await;
        let request = second.stream.next_message().await.unwrap().unwrap();
        assert_eq!(request["addTarget"]["targetId"], 2);
    }
}
