use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value as JsonValue;

use crate::firestore::error::{failed_precondition, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::datastore::{
    StreamCredentials, StreamHandle, StreamKind, StreamingDatastore, StreamingFuture, TokenProviderArc,
};
use crate::firestore::remote::online_state_tracker::ONLINE_STATE_TIMEOUT;
use crate::platform::runtime;
use crate::util::{box_queue_future, hard_assert, AsyncQueue, BackoffSettings, DelayedOperation, ExponentialBackoff, TimerId};

/// Streams left open without traffic for this long are closed.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistentStreamState {
    /// Not started, or stopped cleanly. `start` opens it.
    Initial,
    /// Fetching credentials and opening the transport.
    Starting,
    Open,
    /// Closed by an error. The next `start` backs off first.
    Error,
    /// Waiting on the backoff timer before reconnecting.
    Backoff,
    /// Shut down for good.
    Stopped,
}

#[derive(Clone, Debug)]
pub struct StreamSettings {
    pub backoff: BackoffSettings,
    pub idle_timeout: Duration,
    /// Failed connection time after which the client reports itself offline.
    pub online_state_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            backoff: BackoffSettings::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            online_state_timeout: ONLINE_STATE_TIMEOUT,
        }
    }
}

/// Lifecycle callbacks of a [`PersistentStream`]. All of them run on the
/// async queue.
pub trait PersistentStreamHandler: Send + Sync + 'static {
    fn on_open(&self) -> StreamingFuture<'_, ()>;

    /// An error closes the stream with that error.
    fn on_message(&self, message: JsonValue) -> StreamingFuture<'_, FirestoreResult<()>>;

    fn on_close(&self, error: Option<FirestoreError>) -> StreamingFuture<'_, ()>;
}

struct StreamInner {
    state: PersistentStreamState,
    /// Bumped on every close so callbacks of an older transport are dropped.
    generation: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    pending: Vec<JsonValue>,
    backoff: ExponentialBackoff,
    backoff_operation: Option<DelayedOperation>,
    idle_timer: Option<DelayedOperation>,
}

impl StreamInner {
    fn cancel_timers(&mut self) {
        if let Some(operation) = self.backoff_operation.take() {
            operation.cancel();
        }
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }
}

/// A reconnecting bidirectional stream.
///
/// The stream is driven from the async queue: `start`, `stop` and `send` are
/// called from queued operations, and every transport event is re-enqueued
/// before it reaches the handler.
pub struct PersistentStream {
    kind: StreamKind,
    queue: AsyncQueue,
    datastore: Arc<dyn StreamingDatastore>,
    auth_provider: TokenProviderArc,
    app_check_provider: TokenProviderArc,
    idle_timeout: Duration,
    handler: Weak<dyn PersistentStreamHandler>,
    weak_self: Weak<PersistentStream>,
    inner: Mutex<StreamInner>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        queue: AsyncQueue,
        datastore: Arc<dyn StreamingDatastore>,
        auth_provider: TokenProviderArc,
        app_check_provider: TokenProviderArc,
        settings: StreamSettings,
        handler: Weak<dyn PersistentStreamHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            kind,
            queue,
            datastore,
            auth_provider,
            app_check_provider,
            idle_timeout: settings.idle_timeout,
            handler,
            weak_self: weak_self.clone(),
            inner: Mutex::new(StreamInner {
                state: PersistentStreamState::Initial,
                generation: 0,
                handle: None,
                pending: Vec::new(),
                backoff: ExponentialBackoff::new(settings.backoff),
                backoff_operation: None,
                idle_timer: None,
            }),
        })
    }

    pub fn state(&self) -> PersistentStreamState {
        self.lock_inner().state
    }

    /// True from `start` until the stream closes, including while backing off.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            PersistentStreamState::Starting | PersistentStreamState::Open | PersistentStreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state() == PersistentStreamState::Open
    }

    /// Opens the stream. After an error the reconnect waits for the backoff
    /// delay.
    pub fn start(&self) {
        let generation = {
            let mut inner = self.lock_inner();
            match inner.state {
                PersistentStreamState::Error => {
                    self.perform_backoff(&mut inner);
                    return;
                }
                PersistentStreamState::Stopped => {
                    log::debug!("{:?} stream is stopped, ignoring start", self.kind);
                    return;
                }
                state => hard_assert(
                    state == PersistentStreamState::Initial,
                    0x1e77,
                    format!("{:?} stream started twice (state {state:?})", self.kind),
                ),
            }
            inner.state = PersistentStreamState::Starting;
            inner.generation
        };
        self.spawn_open(generation);
    }

    /// Closes the stream without an error. A later `start` connects at once.
    pub async fn stop(&self) {
        if self.is_started() {
            self.close(PersistentStreamState::Initial, None).await;
        }
    }

    /// Closes the stream for good.
    pub async fn shutdown(&self) {
        if self.is_started() {
            self.close(PersistentStreamState::Stopped, None).await;
        } else {
            let mut inner = self.lock_inner();
            inner.cancel_timers();
            inner.state = PersistentStreamState::Stopped;
        }
    }

    /// Forgets a pending error so the next `start` does not back off.
    pub fn inhibit_backoff(&self) {
        let mut inner = self.lock_inner();
        hard_assert(
            !matches!(
                inner.state,
                PersistentStreamState::Starting | PersistentStreamState::Open | PersistentStreamState::Backoff
            ),
            0x5a1d,
            "inhibit_backoff on a started stream",
        );
        if inner.state == PersistentStreamState::Error {
            inner.state = PersistentStreamState::Initial;
        }
        inner.backoff.reset();
    }

    /// Arms the idle timer. The stream closes if nothing is sent before it
    /// fires.
    pub fn mark_idle(&self) {
        let mut inner = self.lock_inner();
        if inner.state != PersistentStreamState::Open || inner.idle_timer.is_some() {
            return;
        }
        let weak = self.weak_self.clone();
        let timer = self.queue.enqueue_after_delay(self.idle_timer_id(), self.idle_timeout, move || {
            box_queue_future(async move {
                if let Some(stream) = weak.upgrade() {
                    stream.handle_idle_close_timer().await;
                }
            })
        });
        inner.idle_timer = Some(timer);
    }

    /// Sends a message. Messages sent while the transport is still opening
    /// are buffered and flushed once it is open.
    pub async fn send(&self, message: JsonValue) -> FirestoreResult<()> {
        let handle = {
            let mut inner = self.lock_inner();
            if let Some(timer) = inner.idle_timer.take() {
                timer.cancel();
            }
            match inner.state {
                PersistentStreamState::Open => inner.handle.clone(),
                PersistentStreamState::Starting => {
                    inner.pending.push(message);
                    return Ok(());
                }
                state => {
                    return Err(failed_precondition(format!(
                        "cannot send on {:?} stream in state {state:?}",
                        self.kind
                    )))
                }
            }
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.send(message).await {
                log::debug!("{:?} stream send failed: {err}", self.kind);
            }
        }
        Ok(())
    }

    fn lock_inner(&self) -> MutexGuard<'_, StreamInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn idle_timer_id(&self) -> TimerId {
        match self.kind {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        }
    }

    fn backoff_timer_id(&self) -> TimerId {
        match self.kind {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock_inner().generation == generation
    }

    fn perform_backoff(&self, inner: &mut StreamInner) {
        inner.state = PersistentStreamState::Backoff;
        let delay = inner.backoff.next_delay();
        log::debug!("{:?} stream reconnecting in {delay:?}", self.kind);
        let weak = self.weak_self.clone();
        let operation = self.queue.enqueue_after_delay(self.backoff_timer_id(), delay, move || {
            box_queue_future(async move {
                if let Some(stream) = weak.upgrade() {
                    stream.restart_after_backoff();
                }
            })
        });
        inner.backoff_operation = Some(operation);
    }

    fn restart_after_backoff(&self) {
        let generation = {
            let mut inner = self.lock_inner();
            if inner.state != PersistentStreamState::Backoff {
                return;
            }
            inner.backoff_operation = None;
            inner.state = PersistentStreamState::Starting;
            inner.generation
        };
        self.spawn_open(generation);
    }

    fn spawn_open(&self, generation: u64) {
        let Some(stream) = self.weak_self.upgrade() else {
            return;
        };
        runtime::spawn_detached(async move {
            let opened = stream.open_transport().await;
            let queue = stream.queue.clone();
            queue
                .enqueue(async move {
                    match opened {
                        Ok(handle) => stream.handle_transport_open(generation, handle).await,
                        Err(error) => stream.handle_transport_close(generation, error).await,
                    }
                })
                .await;
        });
    }

    async fn open_transport(&self) -> FirestoreResult<Arc<dyn StreamHandle>> {
        let auth_token = self.auth_provider.get_token().await?;
        let app_check_token = self.app_check_provider.get_token().await?;
        let credentials = StreamCredentials {
            auth_token,
            app_check_token,
        };
        match self.kind {
            StreamKind::Listen => self.datastore.open_listen_stream(credentials).await,
            StreamKind::Write => self.datastore.open_write_stream(credentials).await,
        }
    }

    async fn handle_transport_open(&self, generation: u64, handle: Arc<dyn StreamHandle>) {
        let pending = {
            let mut inner = self.lock_inner();
            if inner.generation != generation {
                None
            } else {
                hard_assert(
                    inner.state == PersistentStreamState::Starting,
                    0x3c0f,
                    "transport opened for a stream that is not starting",
                );
                inner.state = PersistentStreamState::Open;
                inner.handle = Some(Arc::clone(&handle));
                Some(std::mem::take(&mut inner.pending))
            }
        };
        let Some(pending) = pending else {
            let _ = handle.close().await;
            return;
        };

        log::debug!("{:?} stream opened", self.kind);
        self.spawn_reader(generation, Arc::clone(&handle));
        for message in pending {
            if let Err(err) = handle.send(message).await {
                log::debug!("{:?} stream dropped a buffered message: {err}", self.kind);
            }
        }
        if let Some(handler) = self.handler.upgrade() {
            handler.on_open().await;
        }
    }

    fn spawn_reader(&self, generation: u64, handle: Arc<dyn StreamHandle>) {
        let Some(stream) = self.weak_self.upgrade() else {
            return;
        };
        runtime::spawn_detached(async move {
            loop {
                let next = handle.next().await;
                let finished = !matches!(next, Some(Ok(_)));
                let target = Arc::clone(&stream);
                let delivered = stream
                    .queue
                    .enqueue(async move {
                        match next {
                            Some(Ok(message)) => target.handle_message(generation, message).await,
                            Some(Err(error)) => target.handle_transport_close(generation, error).await,
                            None => {
                                target
                                    .handle_transport_close(generation, unavailable("stream closed by the backend"))
                                    .await
                            }
                        }
                    })
                    .await;
                if finished || delivered.is_none() || !stream.is_current(generation) {
                    break;
                }
            }
        });
    }

    async fn handle_message(&self, generation: u64, message: JsonValue) {
        {
            let mut inner = self.lock_inner();
            if inner.generation != generation {
                return;
            }
            inner.backoff.reset();
        }
        let Some(handler) = self.handler.upgrade() else {
            return;
        };
        if let Err(error) = handler.on_message(message).await {
            if self.is_current(generation) {
                self.close(PersistentStreamState::Error, Some(error)).await;
            }
        }
    }

    async fn handle_transport_close(&self, generation: u64, error: FirestoreError) {
        if !self.is_current(generation) {
            return;
        }
        self.close(PersistentStreamState::Error, Some(error)).await;
    }

    async fn handle_idle_close_timer(&self) {
        let open = {
            let mut inner = self.lock_inner();
            inner.idle_timer = None;
            inner.state == PersistentStreamState::Open
        };
        if open {
            log::debug!("{:?} stream idle, closing", self.kind);
            self.close(PersistentStreamState::Initial, None).await;
        }
    }

    async fn close(&self, final_state: PersistentStreamState, error: Option<FirestoreError>) {
        hard_assert(
            final_state == PersistentStreamState::Error || error.is_none(),
            0x7d3a,
            "only an error close may carry an error",
        );
        let invalidate_credentials = matches!(&error, Some(err) if err.code == FirestoreErrorCode::Unauthenticated);
        let handle = {
            let mut inner = self.lock_inner();
            inner.cancel_timers();
            inner.generation += 1;
            if final_state != PersistentStreamState::Error {
                inner.backoff.reset();
            } else if matches!(&error, Some(err) if err.code == FirestoreErrorCode::ResourceExhausted) {
                log::debug!("{:?} stream exhausted its quota, using maximum backoff", self.kind);
                inner.backoff.reset_to_max();
            }
            inner.pending.clear();
            inner.state = final_state;
            inner.handle.take()
        };

        if invalidate_credentials {
            self.auth_provider.invalidate_token();
            self.app_check_provider.invalidate_token();
        }
        if let Some(handle) = handle {
            let _ = handle.close().await;
        }
        match &error {
            Some(err) => log::warn!("{:?} stream closed with error: {err}", self.kind),
            None => log::debug!("{:?} stream closed ({final_state:?})", self.kind),
        }
        if let Some(handler) = self.handler.upgrade() {
            handler.on_close(error).await;
        }
    }
}
