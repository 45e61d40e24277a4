//! Single-shot settleable completion state.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::RequestStatus;

/// Settled at most once; observers may read the value any number of times.
///
/// Blocking waiters park on a condition variable, async waiters on a
/// [`Notify`], so the same signal serves threads and tasks.
#[derive(Debug, Default)]
pub struct CompletionSignal {
    value: Mutex<Option<RequestStatus>>,
    cond: Condvar,
    notify: Notify,
}

impl CompletionSignal {
    /// Creates an unsettled signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `status` if the signal is still unsettled. Returns true when
    /// this call settled it.
    pub fn settle(&self, status: RequestStatus) -> bool {
        {
            let mut value = self.lock();
            if value.is_some() {
                return false;
            }
            *value = Some(status);
        }
        self.cond.notify_all();
        self.notify.notify_waiters();
        true
    }

    pub fn is_ready(&self) -> bool {
        self.lock().is_some()
    }

    /// Non-blocking read of the settled value.
    pub fn get(&self) -> Option<RequestStatus> {
        self.lock().clone()
    }

    /// Blocks the calling thread until settled.
    pub fn wait(&self) -> RequestStatus {
        let mut value = self.lock();
        loop {
            if let Some(status) = value.as_ref() {
                return status.clone();
            }
            value = self
                .cond
                .wait(value)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    /// Waits up to `timeout`; `None` if the signal is still unsettled.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RequestStatus> {
        let deadline = Instant::now() + timeout;
        let mut value = self.lock();
        loop {
            if let Some(status) = value.as_ref() {
                return Some(status.clone());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            value = self
                .cond
                .wait_timeout(value, remaining)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    pub async fn wait_async(&self) -> RequestStatus {
        loop {
            let notified = self.notify.notified();
            if let Some(status) = self.get() {
                return status;
            }
            notified.await;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<RequestStatus>> {
        self.value.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
