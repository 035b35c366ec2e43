//! Task spawning and timers that work on native targets and in the browser.

use std::future::Future;
use std::time::Duration;

/// Spawns a background task without waiting for its result.
#[cfg(target_arch = "wasm32")]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

/// Spawns a background task without waiting for its result.
///
/// Uses the ambient tokio runtime when one is running, otherwise a shared
/// runtime owned by the crate whose worker thread drives the task.
#[cfg(not(target_arch = "wasm32"))]
pub fn spawn_detached<F>(future: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    use std::sync::LazyLock;
    use tokio::runtime::{Builder, Handle, Runtime};

    static BACKGROUND_RUNTIME: LazyLock<Runtime> = LazyLock::new(|| {
        Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("firestore-sync-background")
            .enable_all()
            .build()
            .unwrap_or_else(|err| {
                crate::util::fail(0x3e71, format!("failed to build background tokio runtime: {err}"))
            })
    });

    if let Ok(handle) = Handle::try_current() {
        handle.spawn(future);
    } else {
        let _ = BACKGROUND_RUNTIME.spawn(future);
    }
}

/// Waits for `duration`. Returns immediately for a zero duration.
pub async fn sleep(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    sleep_impl(duration).await;
}

#[cfg(target_arch = "wasm32")]
async fn sleep_impl(duration: Duration) {
    gloo_timers::future::sleep(duration).await;
}

#[cfg(not(target_arch = "wasm32"))]
async fn sleep_impl(duration: Duration) {
    tokio::time::sleep(duration).await;
}
