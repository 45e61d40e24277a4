//! In-process simulated messaging fabric.
//!
//! [`SimFabric`] implements [`Transport`] entirely in memory so the facade can
//! be exercised without network hardware. It keeps the semantics the facade
//! depends on:
//!
//! - callbacks for in-flight operations run only inside `worker_progress`
//!   of the owning worker;
//! - eager tag sends complete synchronously, receives match posted order and
//!   the first unexpected message with an equal masked tag;
//! - stream receives with `WAITALL` complete only when the full length is
//!   available;
//! - closing an endpoint resets its peer, and errors can be injected.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::buffer::Buffer;
use crate::config::UcxxConfig;
use crate::error::{self, Error};
use crate::transport::{
    CloseMode, CompletionCallback, ConnRequest, ConnRequestHandle, ConnRequestHandler, EpHandle,
    EpParams, EpTarget, ErrHandlingMode, ErrorHandler, ListenerHandle, OpHandle, StreamRecvFlags,
    Submission, Tag, Transport, TransportStatus, WorkerHandle,
};

static FABRIC_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Tunables of the in-memory fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFabricConfig {
    /// First port handed out to listeners bound to port 0.
    pub ephemeral_port_base: u16,
    /// Maximum unexpected tag messages buffered per worker.
    pub max_unexpected: usize,
}

impl Default for SimFabricConfig {
    fn default() -> Self {
        Self {
            ephemeral_port_base: 40000,
            max_unexpected: 4096,
        }
    }
}

impl SimFabricConfig {
    /// Reads `ephemeral_port_base` and `max_unexpected` from transport
    /// options; unknown keys are ignored.
    pub fn from_options(options: &BTreeMap<String, String>) -> error::Result<Self> {
        let mut config = Self::default();
        if let Some(value) = options.get("ephemeral_port_base") {
            config.ephemeral_port_base = parse_option("ephemeral_port_base", value)?;
        }
        if let Some(value) = options.get("max_unexpected") {
            config.max_unexpected = parse_option("max_unexpected", value)?;
        }
        Ok(config)
    }
}

fn parse_option<T: std::str::FromStr>(key: &str, value: &str) -> error::Result<T> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", key, value)))
}

/// Traffic and lifecycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimFabricStats {
    pub tag_messages: u64,
    pub tag_bytes: u64,
    pub stream_messages: u64,
    pub stream_bytes: u64,
    pub truncated: u64,
    pub endpoints_created: u64,
    pub endpoints_closed: u64,
    pub errors_raised: u64,
}

/// Wire form of a simulated worker address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SimAddress {
    fabric: u64,
    worker: u64,
}

enum Event {
    Complete { op: OpHandle, status: TransportStatus },
    EpError { ep: EpHandle, status: TransportStatus },
    ConnRequest { listener: ListenerHandle, conn: ConnRequestHandle },
}

enum Action {
    Callback(CompletionCallback, TransportStatus),
    Error(ErrorHandler, EpHandle, TransportStatus),
    Accept(ConnRequestHandler, ConnRequest),
}

struct PostedTagRecv {
    op: OpHandle,
    tag: Tag,
    mask: Tag,
    buffer: Buffer,
}

struct PendingStreamRecv {
    op: OpHandle,
    buffer: Buffer,
    flags: StreamRecvFlags,
}

#[derive(Default)]
struct SimWorker {
    unexpected: VecDeque<(Tag, Vec<u8>)>,
    posted: VecDeque<PostedTagRecv>,
    events: VecDeque<Event>,
}

struct SimEndpoint {
    worker: WorkerHandle,
    peer: Option<EpHandle>,
    err_mode: ErrHandlingMode,
    err_handler: Option<ErrorHandler>,
    error: Option<TransportStatus>,
    stream_rx: VecDeque<u8>,
    stream_recvs: VecDeque<PendingStreamRecv>,
}

impl SimEndpoint {
    fn new(worker: WorkerHandle) -> Self {
        Self {
            worker,
            peer: None,
            err_mode: ErrHandlingMode::None,
            err_handler: None,
            error: None,
            stream_rx: VecDeque::new(),
            stream_recvs: VecDeque::new(),
        }
    }
}

struct SimListener {
    worker: WorkerHandle,
    addr: SocketAddr,
    handler: ConnRequestHandler,
}

struct PendingConn {
    listener: ListenerHandle,
    server_ep: EpHandle,
    client_addr: SocketAddr,
}

struct OpState {
    worker: WorkerHandle,
    status: TransportStatus,
    callback: Option<CompletionCallback>,
    /// Data operations are released by the fabric after their callback;
    /// close operations stay until `request_free`.
    auto_free: bool,
}

#[derive(Default)]
struct FabricState {
    workers: HashMap<WorkerHandle, SimWorker>,
    endpoints: HashMap<EpHandle, SimEndpoint>,
    listeners: HashMap<ListenerHandle, SimListener>,
    conn_requests: HashMap<ConnRequestHandle, PendingConn>,
    ops: HashMap<OpHandle, OpState>,
    next_port: u16,
    stats: SimFabricStats,
}

impl FabricState {
    fn queue_event(&mut self, worker: WorkerHandle, event: Event) {
        if let Some(w) = self.workers.get_mut(&worker) {
            w.events.push_back(event);
        }
    }

    fn new_op(
        &mut self,
        op: OpHandle,
        worker: WorkerHandle,
        callback: Option<CompletionCallback>,
        auto_free: bool,
    ) {
        self.ops.insert(
            op,
            OpState {
                worker,
                status: TransportStatus::InProgress,
                callback,
                auto_free,
            },
        );
    }

    fn complete_op(&mut self, op: OpHandle, status: TransportStatus) {
        if let Some(worker) = self.ops.get(&op).map(|state| state.worker) {
            self.queue_event(worker, Event::Complete { op, status });
        }
    }

    /// Marks `ep` failed, fails its pending stream receives and reports the
    /// error to its handler when peer error handling is enabled.
    fn fail_endpoint(&mut self, ep: EpHandle, status: TransportStatus) {
        let (worker, recvs, report) = match self.endpoints.get_mut(&ep) {
            Some(endpoint) if endpoint.error.is_none() => {
                endpoint.error = Some(status);
                endpoint.peer = None;
                (
                    endpoint.worker,
                    std::mem::take(&mut endpoint.stream_recvs),
                    endpoint.err_mode == ErrHandlingMode::Peer && endpoint.err_handler.is_some(),
                )
            }
            _ => return,
        };
        for recv in recvs {
            self.complete_op(recv.op, status);
        }
        if report {
            self.stats.errors_raised += 1;
            self.queue_event(worker, Event::EpError { ep, status });
        }
    }

    /// Completes pending stream receives on `ep` that can now be satisfied.
    fn fill_stream_recvs(&mut self, ep: EpHandle) {
        let mut completed = Vec::new();
        if let Some(endpoint) = self.endpoints.get_mut(&ep) {
            while let Some(front) = endpoint.stream_recvs.front() {
                let wanted = front.buffer.len();
                let available = endpoint.stream_rx.len();
                let ready = if front.flags.contains(StreamRecvFlags::WAITALL) {
                    available >= wanted
                } else {
                    available > 0
                };
                if !ready {
                    break;
                }
                let Some(recv) = endpoint.stream_recvs.pop_front() else {
                    break;
                };
                let take = wanted.min(available);
                let data: Vec<u8> = endpoint.stream_rx.drain(..take).collect();
                recv.buffer.write_at(0, &data);
                completed.push(recv.op);
            }
        }
        for op in completed {
            self.complete_op(op, TransportStatus::Ok);
        }
    }

    fn find_listener(&self, addr: SocketAddr) -> Option<(ListenerHandle, WorkerHandle)> {
        self.listeners.iter().find_map(|(handle, listener)| {
            let ip_matches = listener.addr.ip().is_unspecified()
                || listener.addr.ip() == addr.ip()
                || (listener.addr.ip().is_loopback() && addr.ip().is_loopback());
            (listener.addr.port() == addr.port() && ip_matches)
                .then_some((*handle, listener.worker))
        })
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.listeners.values().any(|l| l.addr.port() == port)
    }

    fn link(&mut self, a: EpHandle, b: EpHandle) {
        if let Some(ep) = self.endpoints.get_mut(&a) {
            ep.peer = Some(b);
        }
        if let Some(ep) = self.endpoints.get_mut(&b) {
            ep.peer = Some(a);
        }
    }
}

/// In-process transport connecting workers created on the same fabric.
pub struct SimFabric {
    id: u64,
    config: SimFabricConfig,
    next_handle: AtomicU64,
    state: Mutex<FabricState>,
}

impl Default for SimFabric {
    fn default() -> Self {
        Self::new(SimFabricConfig::default())
    }
}

impl SimFabric {
    /// Creates an empty fabric.
    pub fn new(config: SimFabricConfig) -> Self {
        let state = FabricState {
            next_port: config.ephemeral_port_base,
            ..FabricState::default()
        };
        Self {
            id: FABRIC_COUNTER.fetch_add(1, Ordering::Relaxed),
            config,
            next_handle: AtomicU64::new(1),
            state: Mutex::new(state),
        }
    }

    /// Creates a fabric from `UcxxConfig::transport_options`.
    pub fn from_config(config: &UcxxConfig) -> error::Result<Self> {
        Ok(Self::new(SimFabricConfig::from_options(&config.transport_options)?))
    }

    pub fn config(&self) -> &SimFabricConfig {
        &self.config
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> SimFabricStats {
        self.state().stats.clone()
    }

    /// Fails `ep` with `status` as if the transport detected it; the error
    /// callback runs on the endpoint worker's next progress.
    pub fn inject_error(&self, ep: EpHandle, status: TransportStatus) {
        debug!(ep = %ep, %status, "injecting endpoint error");
        self.state().fail_endpoint(ep, status);
    }

    /// True while `ep` has a live peer and no injected error.
    pub fn is_connected(&self, ep: EpHandle) -> bool {
        self.state()
            .endpoints
            .get(&ep)
            .map(|endpoint| endpoint.peer.is_some() && endpoint.error.is_none())
            .unwrap_or(false)
    }

    /// Endpoints not yet destroyed.
    pub fn endpoint_count(&self) -> usize {
        self.state().endpoints.len()
    }

    /// Tag messages waiting for a matching receive on `worker`.
    pub fn unexpected_count(&self, worker: WorkerHandle) -> usize {
        self.state()
            .workers
            .get(&worker)
            .map(|w| w.unexpected.len())
            .unwrap_or(0)
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn state(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn decode_address(&self, bytes: &Bytes) -> Result<WorkerHandle, TransportStatus> {
        let address: SimAddress =
            bincode::deserialize(bytes).map_err(|_| TransportStatus::InvalidParam)?;
        if address.fabric != self.id {
            return Err(TransportStatus::Unreachable);
        }
        Ok(WorkerHandle(address.worker))
    }
}

impl Transport for SimFabric {
    fn worker_create(&self) -> Result<WorkerHandle, TransportStatus> {
        let handle = WorkerHandle(self.next_handle());
        self.state().workers.insert(handle, SimWorker::default());
        Ok(handle)
    }

    fn worker_destroy(&self, worker: WorkerHandle) {
        let mut state = self.state();
        state.workers.remove(&worker);
        state.ops.retain(|_, op| op.worker != worker);
        state.listeners.retain(|_, listener| listener.worker != worker);
    }

    fn worker_progress(&self, worker: WorkerHandle) -> usize {
        let actions = {
            let mut state = self.state();
            let events = match state.workers.get_mut(&worker) {
                Some(w) => std::mem::take(&mut w.events),
                None => return 0,
            };
            let mut actions = Vec::with_capacity(events.len());
            for event in events {
                match event {
                    Event::Complete { op, status } => {
                        let Some(entry) = state.ops.get_mut(&op) else {
                            continue;
                        };
                        if entry.status != TransportStatus::InProgress {
                            continue;
                        }
                        entry.status = status;
                        let callback = entry.callback.take();
                        if entry.auto_free {
                            state.ops.remove(&op);
                        }
                        if let Some(callback) = callback {
                            actions.push(Action::Callback(callback, status));
                        }
                    }
                    Event::EpError { ep, status } => {
                        if let Some(handler) = state
                            .endpoints
                            .get(&ep)
                            .and_then(|endpoint| endpoint.err_handler.clone())
                        {
                            actions.push(Action::Error(handler, ep, status));
                        }
                    }
                    Event::ConnRequest { listener, conn } => {
                        let client_addr = state.conn_requests.get(&conn).map(|c| c.client_addr);
                        match state.listeners.get(&listener) {
                            Some(l) => actions.push(Action::Accept(
                                l.handler.clone(),
                                ConnRequest {
                                    handle: conn,
                                    client_addr,
                                },
                            )),
                            None => {
                                trace!(conn = %conn, "dropping connection request for closed listener");
                            }
                        }
                    }
                }
            }
            actions
        };

        let count = actions.len();
        for action in actions {
            match action {
                Action::Callback(callback, status) => callback(status),
                Action::Error(handler, ep, status) => handler(ep, status),
                Action::Accept(handler, request) => handler(request),
            }
        }
        count
    }

    fn worker_address(&self, worker: WorkerHandle) -> Result<Bytes, TransportStatus> {
        if !self.state().workers.contains_key(&worker) {
            return Err(TransportStatus::InvalidParam);
        }
        let address = SimAddress {
            fabric: self.id,
            worker: worker.0,
        };
        bincode::serialize(&address)
            .map(Bytes::from)
            .map_err(|_| TransportStatus::NoResource)
    }

    fn ep_create(
        &self,
        worker: WorkerHandle,
        params: EpParams,
    ) -> Result<EpHandle, TransportStatus> {
        let remote_worker = match &params.target {
            EpTarget::RemoteAddress(bytes) => Some(self.decode_address(bytes)?),
            _ => None,
        };
        let client_port_hint = self.next_handle();

        let mut state = self.state();
        if !state.workers.contains_key(&worker) {
            return Err(TransportStatus::InvalidParam);
        }

        let mut local = SimEndpoint::new(worker);
        local.err_mode = params.err_mode;
        local.err_handler = params.err_handler;

        let handle = match params.target {
            EpTarget::SockAddr(addr) => {
                let (listener, server_worker) =
                    state.find_listener(addr).ok_or(TransportStatus::Unreachable)?;
                let handle = EpHandle(self.next_handle());
                let server_ep = EpHandle(self.next_handle());
                let conn = ConnRequestHandle(self.next_handle());
                state.endpoints.insert(handle, local);
                state
                    .endpoints
                    .insert(server_ep, SimEndpoint::new(server_worker));
                state.link(handle, server_ep);
                let client_addr = SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    (client_port_hint % 20000) as u16 + 20000,
                );
                state.conn_requests.insert(
                    conn,
                    PendingConn {
                        listener,
                        server_ep,
                        client_addr,
                    },
                );
                state.queue_event(server_worker, Event::ConnRequest { listener, conn });
                handle
            }
            EpTarget::ConnRequest(conn) => {
                let pending = state
                    .conn_requests
                    .remove(&conn)
                    .ok_or(TransportStatus::InvalidParam)?;
                if !state.listeners.contains_key(&pending.listener) {
                    return Err(TransportStatus::NotConnected);
                }
                let handle = pending.server_ep;
                let (report, status) = match state.endpoints.get_mut(&handle) {
                    Some(endpoint) => {
                        endpoint.worker = worker;
                        endpoint.err_mode = local.err_mode;
                        endpoint.err_handler = local.err_handler;
                        (
                            endpoint.error.is_some()
                                && endpoint.err_mode == ErrHandlingMode::Peer
                                && endpoint.err_handler.is_some(),
                            endpoint.error,
                        )
                    }
                    None => return Err(TransportStatus::NotConnected),
                };
                if let (true, Some(status)) = (report, status) {
                    state.stats.errors_raised += 1;
                    state.queue_event(worker, Event::EpError { ep: handle, status });
                }
                handle
            }
            EpTarget::RemoteAddress(_) => {
                let remote_worker = remote_worker.ok_or(TransportStatus::InvalidParam)?;
                if !state.workers.contains_key(&remote_worker) {
                    return Err(TransportStatus::Unreachable);
                }
                let handle = EpHandle(self.next_handle());
                let remote_ep = EpHandle(self.next_handle());
                state.endpoints.insert(handle, local);
                state
                    .endpoints
                    .insert(remote_ep, SimEndpoint::new(remote_worker));
                state.link(handle, remote_ep);
                handle
            }
        };

        state.stats.endpoints_created += 1;
        trace!(ep = %handle, worker = %worker, "sim endpoint created");
        Ok(handle)
    }

    fn ep_close_nb(&self, ep: EpHandle, _mode: CloseMode) -> Submission {
        let mut state = self.state();
        let Some(endpoint) = state.endpoints.remove(&ep) else {
            return Submission::Complete(TransportStatus::InvalidParam);
        };
        state.stats.endpoints_closed += 1;

        for recv in endpoint.stream_recvs {
            state.complete_op(recv.op, TransportStatus::Canceled);
        }
        if let Some(peer) = endpoint.peer {
            state.fail_endpoint(peer, TransportStatus::ConnectionReset);
        }

        if !state.workers.contains_key(&endpoint.worker) {
            return Submission::Complete(TransportStatus::Ok);
        }
        let op = OpHandle(self.next_handle());
        state.new_op(op, endpoint.worker, None, false);
        state.complete_op(op, TransportStatus::Ok);
        Submission::InFlight(op)
    }

    fn tag_send_nb(
        &self,
        ep: EpHandle,
        buffer: &Buffer,
        tag: Tag,
        _callback: CompletionCallback,
    ) -> Submission {
        let mut state = self.state();
        let remote_worker = match state.endpoints.get(&ep) {
            Some(endpoint) => match (endpoint.error, endpoint.peer) {
                (Some(status), _) => return Submission::Complete(status),
                (None, Some(peer)) => match state.endpoints.get(&peer) {
                    Some(remote) => remote.worker,
                    None => return Submission::Complete(TransportStatus::ConnectionReset),
                },
                (None, None) => return Submission::Complete(TransportStatus::NotConnected),
            },
            None => return Submission::Complete(TransportStatus::InvalidParam),
        };

        let data = buffer.to_vec();
        state.stats.tag_messages += 1;
        state.stats.tag_bytes += data.len() as u64;

        let max_unexpected = self.config.max_unexpected;
        let Some(receiver) = state.workers.get_mut(&remote_worker) else {
            return Submission::Complete(TransportStatus::Unreachable);
        };
        let matched = receiver
            .posted
            .iter()
            .position(|posted| (posted.tag & posted.mask) == (tag & posted.mask));
        match matched.and_then(|index| receiver.posted.remove(index)) {
            Some(posted) => {
                let status = if data.len() > posted.buffer.len() {
                    posted.buffer.write_at(0, &data[..posted.buffer.len()]);
                    TransportStatus::MessageTruncated
                } else {
                    posted.buffer.write_at(0, &data);
                    TransportStatus::Ok
                };
                if status == TransportStatus::MessageTruncated {
                    state.stats.truncated += 1;
                }
                state.complete_op(posted.op, status);
            }
            None => {
                if receiver.unexpected.len() >= max_unexpected {
                    return Submission::Complete(TransportStatus::NoResource);
                }
                receiver.unexpected.push_back((tag, data));
            }
        }
        Submission::Complete(TransportStatus::Ok)
    }

    fn tag_recv_nb(
        &self,
        worker: WorkerHandle,
        buffer: &Buffer,
        tag: Tag,
        tag_mask: Tag,
        callback: CompletionCallback,
    ) -> Submission {
        let op = OpHandle(self.next_handle());
        let mut state = self.state();
        let Some(receiver) = state.workers.get_mut(&worker) else {
            return Submission::Complete(TransportStatus::InvalidParam);
        };

        let matched = receiver
            .unexpected
            .iter()
            .position(|(msg_tag, _)| (msg_tag & tag_mask) == (tag & tag_mask));
        if let Some((_, data)) = matched.and_then(|index| receiver.unexpected.remove(index)) {
            if data.len() > buffer.len() {
                buffer.write_at(0, &data[..buffer.len()]);
                state.stats.truncated += 1;
                return Submission::Complete(TransportStatus::MessageTruncated);
            }
            buffer.write_at(0, &data);
            return Submission::Complete(TransportStatus::Ok);
        }

        receiver.posted.push_back(PostedTagRecv {
            op,
            tag,
            mask: tag_mask,
            buffer: buffer.clone(),
        });
        state.new_op(op, worker, Some(callback), true);
        Submission::InFlight(op)
    }

    fn stream_send_nb(
        &self,
        ep: EpHandle,
        buffer: &Buffer,
        _callback: CompletionCallback,
    ) -> Submission {
        let mut state = self.state();
        let peer = match state.endpoints.get(&ep) {
            Some(endpoint) => match (endpoint.error, endpoint.peer) {
                (Some(status), _) => return Submission::Complete(status),
                (None, Some(peer)) => peer,
                (None, None) => return Submission::Complete(TransportStatus::NotConnected),
            },
            None => return Submission::Complete(TransportStatus::InvalidParam),
        };

        let data = buffer.to_vec();
        match state.endpoints.get_mut(&peer) {
            Some(remote) => remote.stream_rx.extend(data.iter().copied()),
            None => return Submission::Complete(TransportStatus::ConnectionReset),
        }
        state.stats.stream_messages += 1;
        state.stats.stream_bytes += data.len() as u64;
        state.fill_stream_recvs(peer);
        Submission::Complete(TransportStatus::Ok)
    }

    fn stream_recv_nb(
        &self,
        ep: EpHandle,
        buffer: &Buffer,
        flags: StreamRecvFlags,
        callback: CompletionCallback,
    ) -> Submission {
        let op = OpHandle(self.next_handle());
        let mut state = self.state();
        let worker = match state.endpoints.get_mut(&ep) {
            Some(endpoint) => {
                if let Some(status) = endpoint.error {
                    return Submission::Complete(status);
                }
                let wanted = buffer.len();
                let available = endpoint.stream_rx.len();
                let ready = if flags.contains(StreamRecvFlags::WAITALL) {
                    available >= wanted
                } else {
                    available > 0 || wanted == 0
                };
                if endpoint.stream_recvs.is_empty() && ready {
                    let take = wanted.min(available);
                    let data: Vec<u8> = endpoint.stream_rx.drain(..take).collect();
                    buffer.write_at(0, &data);
                    return Submission::Complete(TransportStatus::Ok);
                }
                endpoint.stream_recvs.push_back(PendingStreamRecv {
                    op,
                    buffer: buffer.clone(),
                    flags,
                });
                endpoint.worker
            }
            None => return Submission::Complete(TransportStatus::InvalidParam),
        };
        state.new_op(op, worker, Some(callback), true);
        Submission::InFlight(op)
    }

    fn request_check_status(&self, op: OpHandle) -> TransportStatus {
        self.state()
            .ops
            .get(&op)
            .map(|entry| entry.status)
            .unwrap_or(TransportStatus::InvalidParam)
    }

    fn request_cancel(&self, worker: WorkerHandle, op: OpHandle) {
        let mut state = self.state();
        let mut found = false;
        if let Some(w) = state.workers.get_mut(&worker) {
            if let Some(index) = w.posted.iter().position(|posted| posted.op == op) {
                w.posted.remove(index);
                found = true;
            }
        }
        if !found {
            for endpoint in state.endpoints.values_mut() {
                if let Some(index) = endpoint.stream_recvs.iter().position(|r| r.op == op) {
                    endpoint.stream_recvs.remove(index);
                    found = true;
                    break;
                }
            }
        }
        if found {
            state.complete_op(op, TransportStatus::Canceled);
        }
    }

    fn request_free(&self, op: OpHandle) {
        self.state().ops.remove(&op);
    }

    fn listener_create(
        &self,
        worker: WorkerHandle,
        addr: SocketAddr,
        handler: ConnRequestHandler,
    ) -> Result<ListenerHandle, TransportStatus> {
        let mut state = self.state();
        if !state.workers.contains_key(&worker) {
            return Err(TransportStatus::InvalidParam);
        }

        let port = if addr.port() == 0 {
            let mut port = state.next_port;
            while state.port_in_use(port) {
                port = port.checked_add(1).ok_or(TransportStatus::NoResource)?;
            }
            state.next_port = port.wrapping_add(1);
            port
        } else if state.port_in_use(addr.port()) {
            return Err(TransportStatus::NoResource);
        } else {
            addr.port()
        };

        let handle = ListenerHandle(self.next_handle());
        let bound = SocketAddr::new(addr.ip(), port);
        state.listeners.insert(
            handle,
            SimListener {
                worker,
                addr: bound,
                handler,
            },
        );
        trace!(listener = %handle, addr = %bound, "sim listener bound");
        Ok(handle)
    }

    fn listener_query(&self, listener: ListenerHandle) -> Result<SocketAddr, TransportStatus> {
        self.state()
            .listeners
            .get(&listener)
            .map(|l| l.addr)
            .ok_or(TransportStatus::InvalidParam)
    }

    fn listener_destroy(&self, listener: ListenerHandle) {
        let mut state = self.state();
        state.listeners.remove(&listener);
        state
            .conn_requests
            .retain(|_, pending| pending.listener != listener);
    }
}
