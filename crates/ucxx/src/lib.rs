//! UCXX-RS: request, endpoint and worker facade over a non-blocking messaging transport
//!
//! Submissions are deferred onto the worker's progress lane, every request
//! settles exactly once, and transport errors on an endpoint cancel all of
//! its outstanding requests. [`sim::SimFabric`] provides an in-process
//! transport.

pub mod address;
pub mod buffer;
pub mod config;
pub mod context;
pub mod delayed;
pub mod endpoint;
pub mod error;
pub mod error_bridge;
pub mod inflight;
pub mod listener;
pub mod request;
pub mod signal;
pub mod sim;
pub mod transport;
pub mod worker;

mod transfer;

pub use address::Address;
pub use buffer::Buffer;
pub use config::{ProgressMode, UcxxConfig};
pub use context::Context;
pub use delayed::{DelayedPayload, DelayedRequestQueue, DelayedTask, SubmitFn};
pub use endpoint::{Endpoint, Parent};
pub use error::{Error, RequestError, RequestStatus, Result};
pub use error_bridge::{CloseCallback, ErrorBridge};
pub use inflight::{InflightRegistry, InflightStats};
pub use listener::{Listener, ListenerCallback};
pub use request::{OperationKind, Request, RequestCallback, RequestId};
pub use signal::CompletionSignal;
pub use sim::{SimFabric, SimFabricConfig, SimFabricStats};
pub use transport::{
    CloseMode, ConnRequest, EpHandle, ErrHandlingMode, OpHandle, Tag, Transport, TransportStatus,
    WorkerHandle,
};
pub use worker::Worker;
