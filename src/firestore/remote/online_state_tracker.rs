use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::firestore::core::types::OnlineState;
use crate::firestore::error::FirestoreError;
use crate::util::{box_queue_future, hard_assert, AsyncQueue, DelayedOperation, TimerId};

/// Failed connection attempts tolerated before reporting `Offline`.
const MAX_WATCH_STREAM_FAILURES: u32 = 1;

/// How long a connection attempt may stay unanswered before reporting
/// `Offline`.
pub const ONLINE_STATE_TIMEOUT: Duration = Duration::from_secs(10);

pub type OnlineStateHandler = Arc<dyn Fn(OnlineState) + Send + Sync>;

struct TrackerState {
    state: OnlineState,
    watch_stream_failures: u32,
    timer: Option<DelayedOperation>,
    should_warn_client_is_offline: bool,
}

/// Derives the client's online state from watch stream health.
///
/// The state starts `Unknown`. A watch stream that opens and receives data
/// flips it to `Online`; one connection failure or an unanswered attempt that
/// outlives [`ONLINE_STATE_TIMEOUT`] flips it to `Offline`.
pub struct OnlineStateTracker {
    queue: AsyncQueue,
    handler: OnlineStateHandler,
    timeout: Duration,
    weak_self: Weak<OnlineStateTracker>,
    state: Mutex<TrackerState>,
}

impl OnlineStateTracker {
    pub fn new(queue: AsyncQueue, handler: OnlineStateHandler) -> Arc<Self> {
        Self::with_timeout(queue, handler, ONLINE_STATE_TIMEOUT)
    }

    pub fn with_timeout(queue: AsyncQueue, handler: OnlineStateHandler, timeout: Duration) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            queue,
            handler,
            timeout,
            weak_self: weak_self.clone(),
            state: Mutex::new(TrackerState {
                state: OnlineState::Unknown,
                watch_stream_failures: 0,
                timer: None,
                should_warn_client_is_offline: true,
            }),
        })
    }

    pub fn state(&self) -> OnlineState {
        self.lock_state().state
    }

    /// Called whenever the watch stream starts connecting. The first attempt
    /// arms the offline timeout.
    pub fn handle_watch_stream_start(&self) {
        let changed = {
            let mut state = self.lock_state();
            if state.watch_stream_failures != 0 {
                return;
            }
            let changed = Self::transition(&mut state, OnlineState::Unknown);
            if state.timer.is_none() {
                let weak = self.weak_self.clone();
                let timer = self
                    .queue
                    .enqueue_after_delay(TimerId::OnlineStateTimeout, self.timeout, move || {
                        box_queue_future(async move {
                            if let Some(tracker) = weak.upgrade() {
                                tracker.handle_timeout();
                            }
                        })
                    });
                state.timer = Some(timer);
            }
            changed
        };
        self.broadcast(changed);
    }

    /// Called when the watch stream failed to connect or dropped.
    pub fn handle_watch_stream_failure(&self, error: &FirestoreError) {
        let changed = {
            let mut state = self.lock_state();
            if state.state == OnlineState::Online {
                Self::transition(&mut state, OnlineState::Unknown)
            } else {
                state.watch_stream_failures += 1;
                if state.watch_stream_failures < MAX_WATCH_STREAM_FAILURES {
                    None
                } else {
                    if let Some(timer) = state.timer.take() {
                        timer.cancel();
                    }
                    Self::warn_offline(
                        &mut state,
                        &format!(
                            "Connection failed {MAX_WATCH_STREAM_FAILURES} times. Most recent error: {error}"
                        ),
                    );
                    Self::transition(&mut state, OnlineState::Offline)
                }
            }
        };
        self.broadcast(changed);
    }

    /// Sets the state explicitly, e.g. `Online` on the first watch change or
    /// `Offline` when the network is disabled.
    pub fn set(&self, new_state: OnlineState) {
        let changed = {
            let mut state = self.lock_state();
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            state.watch_stream_failures = 0;
            if new_state == OnlineState::Online {
                state.should_warn_client_is_offline = false;
            }
            Self::transition(&mut state, new_state)
        };
        self.broadcast(changed);
    }

    pub fn shutdown(&self) {
        if let Some(timer) = self.lock_state().timer.take() {
            timer.cancel();
        }
    }

    fn handle_timeout(&self) {
        let changed = {
            let mut state = self.lock_state();
            if state.timer.take().is_none() {
                return;
            }
            hard_assert(
                state.state == OnlineState::Unknown,
                0x4e2b,
                format!("offline timer fired in state {:?}", state.state),
            );
            Self::warn_offline(
                &mut state,
                &format!("Backend didn't respond within {} seconds.", self.timeout.as_secs()),
            );
            Self::transition(&mut state, OnlineState::Offline)
        };
        self.broadcast(changed);
    }

    fn transition(state: &mut TrackerState, new_state: OnlineState) -> Option<OnlineState> {
        if state.state == new_state {
            return None;
        }
        state.state = new_state;
        Some(new_state)
    }

    fn warn_offline(state: &mut TrackerState, details: &str) {
        let message = format!(
            "Could not reach the backend. {details}\nThe client will operate in offline mode until it reconnects."
        );
        if state.should_warn_client_is_offline {
            log::warn!("{message}");
            state.should_warn_client_is_offline = false;
        } else {
            log::debug!("{message}");
        }
    }

    fn broadcast(&self, changed: Option<OnlineState>) {
        if let Some(new_state) = changed {
            log::debug!("online state changed to {new_state:?}");
            (self.handler)(new_state);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TrackerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
