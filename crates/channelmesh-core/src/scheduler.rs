//! Delayed-action scheduling for coalesced persistence.
//!
//! A [`Debouncer`] runs at most one pending action at a time. Scheduling while
//! an action is pending is a no-op, so a burst of mutations collapses into a
//! single run that happens one `delay` after the first mutation. Timers are
//! tokio timers, so tests drive them with a paused clock
//! (`tokio::time::pause` / `advance`).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Coalesces bursts of scheduling requests into one delayed run
pub struct Debouncer {
    delay: Duration,
    pending: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// The fixed delay between the first request of a burst and the run
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule `action` to run after the delay unless a run is already
    /// pending. Returns `true` if this call armed a new timer.
    ///
    /// Must be called from within a tokio runtime.
    pub fn schedule<F>(&self, action: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut pending = self.pending.lock();
        if pending.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        let delay = self.delay;
        let slot = self.pending.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Clear the slot before running so mutations made during the
            // action arm a fresh timer.
            slot.lock().take();
            action.await;
        });
        *pending = Some(handle);
        debug!(delay_ms = delay.as_millis() as u64, "Debounced action scheduled");
        true
    }

    /// Cancel the pending run, if any. Returns `true` if one was cancelled.
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    /// Whether a run is armed and has not fired yet
    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        if let Some(handle) = self.pending.lock().take() {
            handle.abort();
        }
    }
}
