//! Per-endpoint state shared with the transport's error callback.
//!
//! The transport reports endpoint failures on the progress thread. The
//! bridge records the failure, schedules cancellation of everything still
//! in flight on that endpoint and fires the user's close callback once.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, error, warn};

use crate::error::RequestError;
use crate::inflight::InflightRegistry;
use crate::transport::{EpHandle, ErrorHandler, TransportStatus};
use crate::worker::Worker;

/// One-shot callback run when the endpoint fails or closes.
pub type CloseCallback = Box<dyn FnOnce() + Send>;

struct BridgeState {
    status: TransportStatus,
    close_callback: Option<CloseCallback>,
}

/// Receives transport error callbacks for one endpoint and cancels its inflight
/// requests.
pub struct ErrorBridge {
    state: Mutex<BridgeState>,
    inflight: Arc<InflightRegistry>,
    worker: Weak<Worker>,
}

impl ErrorBridge {
    /// Creates a bridge that cancels `inflight` on `worker` when the endpoint
    /// fails.
    pub fn new(inflight: Arc<InflightRegistry>, worker: &Arc<Worker>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BridgeState {
                status: TransportStatus::Ok,
                close_callback: None,
            }),
            inflight,
            worker: Arc::downgrade(worker),
        })
    }

    /// Last status reported by the transport for this endpoint.
    pub fn status(&self) -> TransportStatus {
        self.lock().status
    }

    /// Error that requests submitted after a failure settle with.
    pub fn request_error(&self) -> RequestError {
        self.status().translate().err().unwrap_or(RequestError::Cancelled)
    }

    /// Replaces any previously registered close callback.
    pub fn set_close_callback(&self, callback: CloseCallback) {
        self.lock().close_callback = Some(callback);
    }

    pub(crate) fn take_close_callback(&self) -> Option<CloseCallback> {
        self.lock().close_callback.take()
    }

    /// Entry point for the transport's error callback.
    pub fn handle_error(&self, ep: EpHandle, status: TransportStatus) {
        self.lock().status = status;

        let error = status.translate().err().unwrap_or(RequestError::Cancelled);
        match self.worker.upgrade() {
            Some(worker) => worker.schedule_request_cancel(Arc::clone(&self.inflight), error),
            None => {
                self.inflight.cancel_all(error);
            }
        }

        if let Some(callback) = self.take_close_callback() {
            run_close_callback(callback);
        }

        if status.is_remote_disconnect() {
            debug!(ep = %ep, ?status, "error callback for endpoint called with status {}", status);
        } else {
            error!(ep = %ep, ?status, "error callback for endpoint called with status {}", status);
        }
    }

    /// Transport-facing handler bound to this bridge.
    pub(crate) fn handler(self: &Arc<Self>) -> ErrorHandler {
        let bridge = Arc::clone(self);
        Arc::new(move |ep, status| bridge.handle_error(ep, status))
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) fn run_close_callback(callback: CloseCallback) {
    if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
        warn!("endpoint close callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::request::{OperationKind, Request};
    use crate::sim::SimFabric;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker() -> Arc<Worker> {
        let context = Context::with_defaults(Arc::new(SimFabric::default()));
        Worker::new(&context).unwrap()
    }

    #[test]
    fn test_initial_status_ok() {
        let worker = worker();
        let bridge = ErrorBridge::new(Arc::new(InflightRegistry::new()), &worker);
        assert_eq!(bridge.status(), TransportStatus::Ok);
        assert_eq!(bridge.request_error(), RequestError::Cancelled);
    }

    #[test]
    fn test_error_schedules_cancel_on_progress() {
        let worker = worker();
        let registry = Arc::new(InflightRegistry::new());
        let bridge = ErrorBridge::new(registry.clone(), &worker);
        let request = Request::detached(OperationKind::TagRecv, None);
        registry.insert(&request);

        bridge.handle_error(EpHandle(1), TransportStatus::ConnectionReset);
        assert_eq!(bridge.status(), TransportStatus::ConnectionReset);
        assert!(!request.is_ready());

        worker.progress();
        assert_eq!(request.status(), Some(Err(RequestError::ConnectionReset)));
        assert!(registry.is_sealed());
    }

    #[test]
    fn test_close_callback_fires_once() {
        let worker = worker();
        let bridge = ErrorBridge::new(Arc::new(InflightRegistry::new()), &worker);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        bridge.set_close_callback(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        bridge.handle_error(EpHandle(1), TransportStatus::EndpointTimeout);
        bridge.handle_error(EpHandle(1), TransportStatus::IoError);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(bridge.take_close_callback().is_none());
        assert_eq!(bridge.status(), TransportStatus::IoError);
    }

    #[test]
    fn test_cancel_without_worker_runs_inline() {
        let registry = Arc::new(InflightRegistry::new());
        let bridge = ErrorBridge::new(registry.clone(), &worker());
        let request = Request::detached(OperationKind::StreamRecv, None);
        registry.insert(&request);

        bridge.handle_error(EpHandle(3), TransportStatus::Unreachable);
        assert!(matches!(
            request.status(),
            Some(Err(RequestError::Transport {
                status: TransportStatus::Unreachable,
                ..
            }))
        ));
    }
}
