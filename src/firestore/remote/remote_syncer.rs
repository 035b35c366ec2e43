use futures::FutureExt;

use crate::firestore::core::target::TargetId;
use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKeySet, MutationBatchResult};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::platform::token::User;

#[cfg(target_arch = "wasm32")]
pub type RemoteStoreFuture<'a, T> = futures::future::LocalBoxFuture<'a, T>;
#[cfg(not(target_arch = "wasm32"))]
pub type RemoteStoreFuture<'a, T> = futures::future::BoxFuture<'a, T>;

#[cfg(target_arch = "wasm32")]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + 'a,
{
    future.boxed_local()
}

#[cfg(not(target_arch = "wasm32"))]
pub fn box_remote_store_future<'a, F, T>(future: F) -> RemoteStoreFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

/// Callbacks from the remote store into the sync engine.
///
/// Every callback runs on the async queue.
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot of watch changes.
    fn apply_remote_event(&self, event: RemoteEvent) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The backend removed a target with an error, typically a permission
    /// failure.
    fn reject_listen(&self, target_id: TargetId, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The oldest outstanding batch was committed.
    fn apply_successful_write(&self, result: MutationBatchResult) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// The oldest outstanding batch failed permanently.
    fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> RemoteStoreFuture<'_, FirestoreResult<()>>;

    /// Keys the backend is known to have for the target: the synced documents
    /// of its view, or the limbo key for a limbo resolution target.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// Switches local state to `user`. The network is disabled while this
    /// runs.
    fn handle_credential_change(&self, user: User) -> RemoteStoreFuture<'_, FirestoreResult<()>>;
}
