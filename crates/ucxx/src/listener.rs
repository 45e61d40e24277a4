//! Passive acceptor for inbound connections.
//!
//! The transport hands each inbound connection request to the listener's
//! callback on the worker's progress thread. The application turns it into
//! an endpoint with
//! [`Endpoint::from_conn_request`](crate::endpoint::Endpoint::from_conn_request).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::debug;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::transport::{ConnRequest, ListenerHandle};
use crate::worker::Worker;

/// Invoked on the progress lane for each incoming connection request.
pub type ListenerCallback = Arc<dyn Fn(&Arc<Listener>, ConnRequest) + Send + Sync>;

/// Accepts incoming connections on a worker.
pub struct Listener {
    worker: Arc<Worker>,
    bound: Mutex<Option<(ListenerHandle, SocketAddr)>>,
}

impl Listener {
    /// Listens on all interfaces at `port`; port 0 picks a free port.
    pub fn new<F>(worker: &Arc<Worker>, port: u16, callback: F) -> Result<Arc<Self>>
    where
        F: Fn(&Arc<Listener>, ConnRequest) + Send + Sync + 'static,
    {
        let worker_handle = worker
            .handle()
            .ok_or_else(|| Error::NotInitialized("worker".to_string()))?;

        let listener = Arc::new(Self {
            worker: Arc::clone(worker),
            bound: Mutex::new(None),
        });

        let weak: Weak<Listener> = Arc::downgrade(&listener);
        let callback: ListenerCallback = Arc::new(callback);
        let handler = Arc::new(move |request: ConnRequest| match weak.upgrade() {
            Some(listener) => callback(&listener, request),
            None => debug!(conn = %request.handle, "connection request for dropped listener"),
        });

        let transport = worker.transport();
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let handle = transport
            .listener_create(worker_handle, bind, handler)
            .map_err(Error::transport)?;
        let addr = match transport.listener_query(handle) {
            Ok(addr) => addr,
            Err(status) => {
                transport.listener_destroy(handle);
                return Err(Error::transport(status));
            }
        };

        debug!(listener = %handle, %addr, "listener started");
        *listener.lock() = Some((handle, addr));
        Ok(listener)
    }

    /// Accepts `request` with the configured endpoint error handling.
    pub fn create_endpoint_from_conn_request(
        self: &Arc<Self>,
        request: ConnRequest,
    ) -> Result<Arc<Endpoint>> {
        let error_handling = self.worker.context().config().endpoint_error_handling;
        Endpoint::from_conn_request(self, request, error_handling)
    }

    /// `None` once closed.
    pub fn handle(&self) -> Option<ListenerHandle> {
        self.lock().map(|(handle, _)| handle)
    }

    /// Worker that accepts and progresses connections.
    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Bound port, resolved when created with port 0.
    pub fn port(&self) -> Option<u16> {
        self.lock().map(|(_, addr)| addr.port())
    }

    /// Bound address, `None` once closed.
    pub fn ip(&self) -> Option<IpAddr> {
        self.lock().map(|(_, addr)| addr.ip())
    }

    /// Stops accepting connections. Idempotent.
    pub fn close(&self) {
        if let Some((handle, addr)) = self.lock().take() {
            self.worker.transport().listener_destroy(handle);
            debug!(listener = %handle, %addr, "listener closed");
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<(ListenerHandle, SocketAddr)>> {
        self.bound.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::sim::SimFabric;

    fn worker() -> Arc<Worker> {
        Worker::new(&Context::with_defaults(Arc::new(SimFabric::default()))).unwrap()
    }

    #[test]
    fn test_listener_ephemeral_port() {
        let worker = worker();
        let listener = Listener::new(&worker, 0, |_, _| {}).unwrap();
        assert!(listener.handle().is_some());
        assert_ne!(listener.port(), Some(0));
        assert_eq!(listener.ip(), Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)));
        assert!(Arc::ptr_eq(listener.worker(), &worker));
    }

    #[test]
    fn test_listener_explicit_port_conflict() {
        let worker = worker();
        let first = Listener::new(&worker, 13337, |_, _| {}).unwrap();
        assert_eq!(first.port(), Some(13337));
        assert!(Listener::new(&worker, 13337, |_, _| {}).is_err());

        first.close();
        assert!(first.handle().is_none());
        assert!(Listener::new(&worker, 13337, |_, _| {}).is_ok());
    }

    #[test]
    fn test_listener_requires_worker() {
        let worker = worker();
        worker.shutdown();
        assert!(matches!(
            Listener::new(&worker, 0, |_, _| {}),
            Err(Error::NotInitialized(_))
        ));
    }
}
