//! Connection to a single peer.
//!
//! An [`Endpoint`] owns its transport endpoint handle, the [`ErrorBridge`]
//! the transport reports failures to and the [`InflightRegistry`] of its
//! outstanding requests. Requests hold a strong reference to their endpoint
//! until they settle, while the registry only holds weak references back, so
//! outstanding work keeps the endpoint alive without forming a cycle.
//!
//! Teardown ([`Endpoint::close`], or `Drop`) force-closes the transport
//! endpoint, spinning worker progress until the close completes, cancels
//! every request still in flight and fires the close callback if the error
//! path has not already done so.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use tracing::{debug, error, trace};

use crate::address::Address;
use crate::buffer::Buffer;
use crate::delayed::DelayedPayload;
use crate::error::{Error, RequestError, RequestStatus, Result};
use crate::error_bridge::{run_close_callback, ErrorBridge};
use crate::inflight::InflightRegistry;
use crate::listener::Listener;
use crate::request::{OperationKind, Request, RequestCallback};
use crate::transport::{
    CloseMode, ConnRequest, EpFlags, EpHandle, EpParams, EpTarget, ErrHandlingMode, Submission,
    Tag, TransportStatus, WorkerHandle,
};
use crate::worker::Worker;

/// Owner an endpoint was created from.
#[derive(Clone)]
pub enum Parent {
    Worker(Arc<Worker>),
    Listener(Arc<Listener>),
}

impl Parent {
    /// Worker the endpoint progresses on; a listener's own worker.
    pub fn worker(&self) -> &Arc<Worker> {
        match self {
            Parent::Worker(worker) => worker,
            Parent::Listener(listener) => listener.worker(),
        }
    }

    /// Owned handle to the worker.
    pub fn resolve_worker(&self) -> Arc<Worker> {
        Arc::clone(self.worker())
    }
}

/// Connection to one remote worker.
///
/// Pending requests hold a strong reference, so dropping the last
/// application handle defers close until they settle.
pub struct Endpoint {
    handle: Mutex<Option<EpHandle>>,
    parent: Parent,
    error_handling: bool,
    bridge: Arc<ErrorBridge>,
    inflight: Arc<InflightRegistry>,
}

impl Endpoint {
    /// Connects to a listener at `hostname:port`.
    pub fn from_hostname(
        worker: &Arc<Worker>,
        hostname: &str,
        port: u16,
        error_handling: bool,
    ) -> Result<Arc<Self>> {
        ensure_worker(worker)?;
        let addr = resolve(hostname, port)?;

        let mut params = EpParams::new(EpTarget::SockAddr(addr));
        params.flags = EpFlags::CLIENT_SERVER;
        Self::create(Parent::Worker(Arc::clone(worker)), params, error_handling)
    }

    /// Accepts a connection request handed to a listener callback.
    pub fn from_conn_request(
        listener: &Arc<Listener>,
        conn_request: ConnRequest,
        error_handling: bool,
    ) -> Result<Arc<Self>> {
        if listener.handle().is_none() {
            return Err(Error::NotInitialized("listener".to_string()));
        }

        let mut params = EpParams::new(EpTarget::ConnRequest(conn_request.handle));
        params.flags = EpFlags::NO_LOOPBACK;
        Self::create(Parent::Listener(Arc::clone(listener)), params, error_handling)
    }

    /// Connects directly to a peer worker by its serialised address.
    pub fn from_worker_address(
        worker: &Arc<Worker>,
        address: &Address,
        error_handling: bool,
    ) -> Result<Arc<Self>> {
        ensure_worker(worker)?;
        if address.is_empty() {
            return Err(Error::NotInitialized("address".to_string()));
        }

        let params = EpParams::new(EpTarget::RemoteAddress(address.as_bytes().clone()));
        Self::create(Parent::Worker(Arc::clone(worker)), params, error_handling)
    }

    fn create(parent: Parent, mut params: EpParams, error_handling: bool) -> Result<Arc<Self>> {
        let worker = parent.resolve_worker();
        let worker_handle = ensure_worker(&worker)?;

        let inflight = Arc::new(InflightRegistry::new());
        worker.register_inflight(&inflight);
        let bridge = ErrorBridge::new(Arc::clone(&inflight), &worker);
        params.err_mode = if error_handling {
            ErrHandlingMode::Peer
        } else {
            ErrHandlingMode::None
        };
        params.err_handler = Some(bridge.handler());

        let handle = worker
            .transport()
            .ep_create(worker_handle, params)
            .map_err(Error::transport)?;
        debug!(ep = %handle, worker = %worker_handle, error_handling, "endpoint created");

        Ok(Arc::new(Self {
            handle: Mutex::new(Some(handle)),
            parent,
            error_handling,
            bridge,
            inflight,
        }))
    }

    /// Transport handle; `None` once closed.
    pub fn handle(&self) -> Option<EpHandle> {
        *self.lock()
    }

    /// Worker resolved from the endpoint's parent.
    pub fn worker(&self) -> &Arc<Worker> {
        self.parent.worker()
    }

    /// Whether peer failures are reported for this endpoint.
    pub fn error_handling(&self) -> bool {
        self.error_handling
    }

    /// Requests submitted and not yet settled.
    pub fn inflight_count(&self) -> usize {
        self.inflight.len()
    }

    /// False once the transport reported an error. Always true with error
    /// handling disabled.
    pub fn is_alive(&self) -> bool {
        !self.error_handling || self.bridge.status().is_ok()
    }

    /// Surfaces the failure the transport reported for this endpoint, if any.
    pub fn raise_on_error(&self) -> Result<()> {
        if self.is_alive() {
            return Ok(());
        }
        let status = self.bridge.status();
        let message = format!(
            "endpoint {} error: {}",
            self.handle().map(|h| h.to_string()).unwrap_or_default(),
            status
        );
        match status {
            TransportStatus::ConnectionReset => Err(Error::ConnectionReset(message)),
            TransportStatus::EndpointTimeout => Err(Error::EndpointTimeout(message)),
            other => Err(Error::Transport {
                status: other,
                message,
            }),
        }
    }

    /// Registers the callback fired once when the endpoint fails or closes,
    /// replacing any previous one.
    pub fn set_close_callback<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.bridge.set_close_callback(Box::new(callback));
    }

    /// Sends `buffer` on the ordered byte stream.
    pub fn stream_send(self: &Arc<Self>, buffer: Buffer) -> Result<Arc<Request>> {
        self.submit(OperationKind::StreamSend, buffer, None, None)
    }

    /// Completes only once `buffer.len()` bytes have been received.
    pub fn stream_recv(self: &Arc<Self>, buffer: Buffer) -> Result<Arc<Request>> {
        self.submit(OperationKind::StreamRecv, buffer, None, None)
    }

    /// Sends `buffer` as one message carrying `tag`.
    pub fn tag_send(self: &Arc<Self>, buffer: Buffer, tag: Tag) -> Result<Arc<Request>> {
        self.submit(OperationKind::TagSend, buffer, Some(tag), None)
    }

    /// Receives the first message whose tag equals `tag` exactly.
    pub fn tag_recv(self: &Arc<Self>, buffer: Buffer, tag: Tag) -> Result<Arc<Request>> {
        self.submit(OperationKind::TagRecv, buffer, Some(tag), None)
    }

    /// As [`stream_send`](Self::stream_send), running `callback` on the
    /// progress lane once settled.
    pub fn stream_send_with_callback<F>(
        self: &Arc<Self>,
        buffer: Buffer,
        callback: F,
    ) -> Result<Arc<Request>>
    where
        F: FnOnce(RequestStatus) + Send + 'static,
    {
        self.submit(OperationKind::StreamSend, buffer, None, Some(Box::new(callback)))
    }

    /// As [`stream_recv`](Self::stream_recv) with a completion callback.
    pub fn stream_recv_with_callback<F>(
        self: &Arc<Self>,
        buffer: Buffer,
        callback: F,
    ) -> Result<Arc<Request>>
    where
        F: FnOnce(RequestStatus) + Send + 'static,
    {
        self.submit(OperationKind::StreamRecv, buffer, None, Some(Box::new(callback)))
    }

    /// As [`tag_send`](Self::tag_send) with a completion callback.
    pub fn tag_send_with_callback<F>(
        self: &Arc<Self>,
        buffer: Buffer,
        tag: Tag,
        callback: F,
    ) -> Result<Arc<Request>>
    where
        F: FnOnce(RequestStatus) + Send + 'static,
    {
        self.submit(OperationKind::TagSend, buffer, Some(tag), Some(Box::new(callback)))
    }

    /// As [`tag_recv`](Self::tag_recv) with a completion callback.
    pub fn tag_recv_with_callback<F>(
        self: &Arc<Self>,
        buffer: Buffer,
        tag: Tag,
        callback: F,
    ) -> Result<Arc<Request>>
    where
        F: FnOnce(RequestStatus) + Send + 'static,
    {
        self.submit(OperationKind::TagRecv, buffer, Some(tag), Some(Box::new(callback)))
    }

    fn submit(
        self: &Arc<Self>,
        kind: OperationKind,
        buffer: Buffer,
        tag: Option<Tag>,
        callback: Option<RequestCallback>,
    ) -> Result<Arc<Request>> {
        let endpoint = self
            .handle()
            .ok_or_else(|| Error::NotInitialized("endpoint".to_string()))?;
        let worker = ensure_worker(self.worker())?;

        let request = Request::new(
            kind,
            Arc::clone(self),
            Arc::clone(&self.inflight),
            self.worker().new_completion_signal(),
            callback,
        );
        let preempt = if self.inflight.insert(&request) {
            None
        } else {
            Some(self.bridge.request_error())
        };

        trace!(request = %request.id(), op = %kind, ep = %endpoint, size = buffer.len(), "queued");
        let payload = DelayedPayload {
            transport: self.worker().transport(),
            worker,
            endpoint,
            kind,
            length: buffer.len(),
            buffer,
            tag,
            request: Arc::clone(&request),
            preempt,
        };
        self.worker().register_delayed(kind.submit_fn(), payload);
        Ok(request)
    }

    /// Tears the endpoint down. Every request still in flight is cancelled
    /// by the time this returns. Idempotent; never fails.
    pub fn close(&self) {
        let Some(handle) = self.lock().take() else {
            return;
        };

        let transport = self.worker().transport();
        self.worker()
            .schedule_request_cancel(Arc::clone(&self.inflight), RequestError::Cancelled);

        match transport.ep_close_nb(handle, CloseMode::Force) {
            Submission::InFlight(op) => {
                while transport.request_check_status(op) == TransportStatus::InProgress
                    && self.worker().handle().is_some()
                {
                    if self.worker().progress() == 0 {
                        thread::yield_now();
                    }
                }
                let status = transport.request_check_status(op);
                if !status.is_ok() && status != TransportStatus::InProgress {
                    error!(ep = %handle, %status, "error while closing endpoint");
                }
                transport.request_free(op);
            }
            Submission::Complete(status) if !status.is_ok() => {
                error!(ep = %handle, %status, "error while closing endpoint");
            }
            Submission::Complete(_) => {}
        }

        // Flushes the cancellation scheduled above.
        self.worker().progress();

        if let Some(callback) = self.bridge.take_close_callback() {
            run_close_callback(callback);
        }
        debug!(ep = %handle, "endpoint closed");
    }

    fn lock(&self) -> MutexGuard<'_, Option<EpHandle>> {
        self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("handle", &self.handle())
            .field("error_handling", &self.error_handling)
            .field("status", &self.bridge.status())
            .field("inflight", &self.inflight.len())
            .finish()
    }
}

fn ensure_worker(worker: &Worker) -> Result<WorkerHandle> {
    worker
        .handle()
        .ok_or_else(|| Error::NotInitialized("worker".to_string()))
}

/// Resolves `hostname`, preferring IPv4 results.
fn resolve(hostname: &str, port: u16) -> Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = (hostname, port)
        .to_socket_addrs()
        .map_err(|e| Error::InvalidAddress(format!("{}: {}", hostname, e)))?
        .collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| Error::InvalidAddress(hostname.to_string()))
}
