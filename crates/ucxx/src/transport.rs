//! Interface to the underlying messaging transport.
//!
//! This module defines the [`Transport`] trait that the facade drives, plus
//! the opaque handles, parameter blocks and status codes that cross it.
//! Every non-blocking call returns a [`Submission`]: either a terminal status
//! (the operation completed synchronously and its callback will never run)
//! or an in-flight handle whose callback fires later from
//! [`Transport::worker_progress`].

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::buffer::Buffer;
use crate::error::{RequestError, RequestStatus};

/// 64-bit message tag.
pub type Tag = u64;

/// Receive mask selecting exact tag matches.
pub const TAG_MASK_FULL: Tag = u64::MAX;

macro_rules! opaque_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

opaque_handle!(
    /// Transport worker (progress engine) handle.
    WorkerHandle
);
opaque_handle!(
    /// Transport endpoint handle.
    EpHandle
);
opaque_handle!(
    /// Handle to an operation the transport is still working on.
    OpHandle
);
opaque_handle!(
    /// Transport listener handle.
    ListenerHandle
);
opaque_handle!(
    /// Inbound connection request produced by a listener.
    ConnRequestHandle
);

/// Status codes reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportStatus {
    Ok,
    InProgress,
    Canceled,
    ConnectionReset,
    EndpointTimeout,
    Unreachable,
    MessageTruncated,
    InvalidParam,
    NoResource,
    NotConnected,
    Unsupported,
    IoError,
}

impl TransportStatus {
    /// True for `Ok` only; `InProgress` is not a success.
    pub fn is_ok(self) -> bool {
        self == TransportStatus::Ok
    }

    /// Human-readable text, as logged.
    pub fn description(self) -> &'static str {
        match self {
            TransportStatus::Ok => "success",
            TransportStatus::InProgress => "operation in progress",
            TransportStatus::Canceled => "operation canceled",
            TransportStatus::ConnectionReset => "connection reset by remote peer",
            TransportStatus::EndpointTimeout => "endpoint timeout",
            TransportStatus::Unreachable => "destination is unreachable",
            TransportStatus::MessageTruncated => "message truncated",
            TransportStatus::InvalidParam => "invalid parameter",
            TransportStatus::NoResource => "resources are not available",
            TransportStatus::NotConnected => "no pending connection",
            TransportStatus::Unsupported => "operation is not supported",
            TransportStatus::IoError => "input/output error",
        }
    }

    /// Peer-side disconnects that are expected during normal teardown.
    pub fn is_remote_disconnect(self) -> bool {
        matches!(
            self,
            TransportStatus::ConnectionReset | TransportStatus::EndpointTimeout
        )
    }

    /// Converts a terminal transport status into a request status.
    pub fn translate(self) -> RequestStatus {
        match self {
            TransportStatus::Ok => Ok(()),
            TransportStatus::Canceled => Err(RequestError::Cancelled),
            TransportStatus::ConnectionReset => Err(RequestError::ConnectionReset),
            TransportStatus::EndpointTimeout => Err(RequestError::EndpointTimeout),
            other => Err(RequestError::Transport {
                status: other,
                message: other.description().to_string(),
            }),
        }
    }
}

impl fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Result of a non-blocking transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Completed synchronously; the completion callback is dropped unused.
    Complete(TransportStatus),
    /// Still running; the callback fires from a later progress call.
    InFlight(OpHandle),
}

/// Invoked once by the transport when an in-flight operation finishes.
pub type CompletionCallback = Box<dyn FnOnce(TransportStatus) + Send>;

/// Per-endpoint error callback.
pub type ErrorHandler = Arc<dyn Fn(EpHandle, TransportStatus) + Send + Sync>;

/// Listener callback receiving inbound connection requests.
pub type ConnRequestHandler = Arc<dyn Fn(ConnRequest) + Send + Sync>;

/// Inbound connection request handed from a listener to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnRequest {
    pub handle: ConnRequestHandle,
    pub client_addr: Option<SocketAddr>,
}

/// Whether the transport reports peer failures on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ErrHandlingMode {
    /// Peer failures are not reported.
    #[default]
    None,
    /// Peer failures are reported through the endpoint error callback.
    Peer,
}

/// How `ep_close_nb` treats outstanding operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CloseMode {
    /// Release local resources without waiting for the peer.
    #[default]
    Force,
    /// Flush outstanding operations and notify the peer first.
    Flush,
}

/// Endpoint creation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpFlags(u32);

impl EpFlags {
    pub const CLIENT_SERVER: Self = Self(1);
    pub const NO_LOOPBACK: Self = Self(2);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for EpFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Stream receive flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamRecvFlags(u32);

impl StreamRecvFlags {
    /// Complete only once the full requested length has arrived.
    pub const WAITALL: Self = Self(1);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

/// What an endpoint connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EpTarget {
    SockAddr(SocketAddr),
    ConnRequest(ConnRequestHandle),
    RemoteAddress(Bytes),
}

/// Endpoint creation parameters.
#[derive(Clone)]
pub struct EpParams {
    pub target: EpTarget,
    pub flags: EpFlags,
    pub err_mode: ErrHandlingMode,
    pub err_handler: Option<ErrorHandler>,
}

impl EpParams {
    /// Parameters with no flags and error handling off.
    pub fn new(target: EpTarget) -> Self {
        Self {
            target,
            flags: EpFlags::empty(),
            err_mode: ErrHandlingMode::None,
            err_handler: None,
        }
    }
}

impl fmt::Debug for EpParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EpParams")
            .field("target", &self.target)
            .field("flags", &self.flags)
            .field("err_mode", &self.err_mode)
            .field("err_handler", &self.err_handler.is_some())
            .finish()
    }
}

/// Native messaging transport driven by the facade.
///
/// Calls that take a worker or endpoint handle are issued from the thread
/// that owns that worker's progress; completion and error callbacks run only
/// from inside [`Transport::worker_progress`].
pub trait Transport: Send + Sync + 'static {
    fn worker_create(&self) -> Result<WorkerHandle, TransportStatus>;

    fn worker_destroy(&self, worker: WorkerHandle);

    /// Advances the worker once without blocking; returns the number of
    /// events processed.
    fn worker_progress(&self, worker: WorkerHandle) -> usize;

    /// Serialised worker address that peers can connect to.
    fn worker_address(&self, worker: WorkerHandle) -> Result<Bytes, TransportStatus>;

    fn ep_create(&self, worker: WorkerHandle, params: EpParams)
        -> Result<EpHandle, TransportStatus>;

    fn ep_close_nb(&self, ep: EpHandle, mode: CloseMode) -> Submission;

    fn tag_send_nb(
        &self,
        ep: EpHandle,
        buffer: &Buffer,
        tag: Tag,
        callback: CompletionCallback,
    ) -> Submission;

    fn tag_recv_nb(
        &self,
        worker: WorkerHandle,
        buffer: &Buffer,
        tag: Tag,
        tag_mask: Tag,
        callback: CompletionCallback,
    ) -> Submission;

    fn stream_send_nb(
        &self,
        ep: EpHandle,
        buffer: &Buffer,
        callback: CompletionCallback,
    ) -> Submission;

    fn stream_recv_nb(
        &self,
        ep: EpHandle,
        buffer: &Buffer,
        flags: StreamRecvFlags,
        callback: CompletionCallback,
    ) -> Submission;

    fn request_check_status(&self, op: OpHandle) -> TransportStatus;

    /// Asks the transport to abort an in-flight operation; its callback
    /// still fires, with [`TransportStatus::Canceled`].
    fn request_cancel(&self, worker: WorkerHandle, op: OpHandle);

    fn request_free(&self, op: OpHandle);

    fn listener_create(
        &self,
        worker: WorkerHandle,
        addr: SocketAddr,
        handler: ConnRequestHandler,
    ) -> Result<ListenerHandle, TransportStatus>;

    fn listener_query(&self, listener: ListenerHandle) -> Result<SocketAddr, TransportStatus>;

    fn listener_destroy(&self, listener: ListenerHandle);
}
