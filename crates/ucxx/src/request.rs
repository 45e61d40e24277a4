//! Outstanding transport operations.
//!
//! A [`Request`] is created on the application lane by an endpoint and
//! settled exactly once on the progress lane, either from the synchronous
//! completion branch of its delayed submission, from the transport's
//! completion callback, or by cancellation.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::{trace, warn};

use crate::endpoint::Endpoint;
use crate::error::{RequestError, RequestStatus};
use crate::inflight::InflightRegistry;
use crate::signal::CompletionSignal;
use crate::transport::OpHandle;

static REQUEST_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a request for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl RequestId {
    fn next() -> Self {
        RequestId(REQUEST_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Data-transfer operation a request performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    StreamSend,
    StreamRecv,
    TagSend,
    TagRecv,
}

impl OperationKind {
    /// Short name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            OperationKind::StreamSend => "stream_send",
            OperationKind::StreamRecv => "stream_recv",
            OperationKind::TagSend => "tag_send",
            OperationKind::TagRecv => "tag_recv",
        }
    }

    pub fn is_send(self) -> bool {
        matches!(self, OperationKind::StreamSend | OperationKind::TagSend)
    }

    pub fn is_tag(self) -> bool {
        matches!(self, OperationKind::TagSend | OperationKind::TagRecv)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// User completion callback; receives the terminal status.
pub type RequestCallback = Box<dyn FnOnce(RequestStatus) + Send>;

#[derive(Default)]
struct RequestState {
    callback: Option<RequestCallback>,
    endpoint: Option<Arc<Endpoint>>,
    registry: Option<Arc<InflightRegistry>>,
    transport_handle: Option<OpHandle>,
}

/// One submitted operation.
///
/// Settles exactly once; every waiter observes the same status.
pub struct Request {
    id: RequestId,
    kind: OperationKind,
    signal: CompletionSignal,
    state: Mutex<RequestState>,
}

impl Request {
    /// Builds a pending request that keeps `endpoint` alive until it settles.
    pub(crate) fn new(
        kind: OperationKind,
        endpoint: Arc<Endpoint>,
        registry: Arc<InflightRegistry>,
        signal: CompletionSignal,
        callback: Option<RequestCallback>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: RequestId::next(),
            kind,
            signal,
            state: Mutex::new(RequestState {
                callback,
                endpoint: Some(endpoint),
                registry: Some(registry),
                transport_handle: None,
            }),
        })
    }

    /// A request with no owning endpoint or registry.
    pub fn detached(kind: OperationKind, callback: Option<RequestCallback>) -> Arc<Self> {
        Arc::new(Self {
            id: RequestId::next(),
            kind,
            signal: CompletionSignal::new(),
            state: Mutex::new(RequestState {
                callback,
                ..RequestState::default()
            }),
        })
    }

    /// Unique within the process.
    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// True once settled.
    pub fn is_ready(&self) -> bool {
        self.signal.is_ready()
    }

    /// Terminal status if settled, without blocking.
    pub fn status(&self) -> Option<RequestStatus> {
        self.signal.get()
    }

    /// Blocks until settled. Requires something else to drive progress,
    /// typically the worker's progress thread.
    pub fn wait(&self) -> RequestStatus {
        self.signal.wait()
    }

    /// As [`wait`](Self::wait), giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RequestStatus> {
        self.signal.wait_timeout(timeout)
    }

    pub async fn completed(&self) -> RequestStatus {
        self.signal.wait_async().await
    }

    /// In-flight transport handle; `None` before submission or when the
    /// transport completed the operation synchronously.
    pub fn transport_handle(&self) -> Option<OpHandle> {
        self.lock().transport_handle
    }

    /// Requests cancellation. The request settles with
    /// [`RequestError::Cancelled`] on the owning worker's next progress
    /// cycle unless it completes first.
    pub fn cancel(self: &Arc<Self>) {
        let endpoint = self.lock().endpoint.clone();
        match endpoint {
            Some(endpoint) => {
                let request = Arc::clone(self);
                endpoint
                    .worker()
                    .register_task(move || request.cancel_with(RequestError::Cancelled));
            }
            None => self.cancel_with(RequestError::Cancelled),
        }
    }

    /// Settles with `error` and aborts the transport operation if one is
    /// still running. Progress lane only.
    pub(crate) fn cancel_with(&self, error: RequestError) {
        let (endpoint, handle) = {
            let state = self.lock();
            (state.endpoint.clone(), state.transport_handle)
        };
        if !self.settle(Err(error)) {
            return;
        }
        if let (Some(endpoint), Some(op)) = (endpoint, handle) {
            let worker = endpoint.worker();
            if let Some(worker_handle) = worker.handle() {
                worker.transport().request_cancel(worker_handle, op);
            }
        }
    }

    pub(crate) fn set_transport_handle(&self, op: OpHandle) {
        self.lock().transport_handle = Some(op);
    }

    /// Moves the request out of `pending`. Only the first call has any
    /// effect; returns whether this call settled the request.
    pub(crate) fn settle(&self, status: RequestStatus) -> bool {
        if !self.signal.settle(status.clone()) {
            return false;
        }
        let (callback, endpoint, registry) = {
            let mut state = self.lock();
            (
                state.callback.take(),
                state.endpoint.take(),
                state.registry.take(),
            )
        };
        trace!(request = %self.id, op = %self.kind, status = ?status, "request settled");

        if let Some(registry) = registry {
            registry.remove(self.id);
        }
        if let Some(callback) = callback {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(status))).is_err() {
                warn!(request = %self.id, op = %self.kind, "request callback panicked");
            }
        }
        // Last reference to the endpoint may go here, which runs its close.
        drop(endpoint);
        true
    }

    fn lock(&self) -> MutexGuard<'_, RequestState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .finish()
    }
}
