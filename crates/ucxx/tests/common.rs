//! Common test utilities for client/server integration tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use ucxx::{Context, Endpoint, Listener, SimFabric, UcxxConfig, Worker};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A client worker and a server worker with a listener on the same fabric.
/// Accepted server endpoints are collected in arrival order.
pub struct Harness {
    pub fabric: Arc<SimFabric>,
    pub context: Arc<Context>,
    pub client: Arc<Worker>,
    pub server: Arc<Worker>,
    pub listener: Arc<Listener>,
    accepted: Arc<Mutex<Vec<Arc<Endpoint>>>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(UcxxConfig::default())
    }

    pub fn with_config(config: UcxxConfig) -> Self {
        init_tracing();
        let fabric = Arc::new(SimFabric::from_config(&config).unwrap());
        let context = Context::new(fabric.clone(), config);
        let client = Worker::new(&context).unwrap();
        let server = Worker::new(&context).unwrap();

        let accepted = Arc::new(Mutex::new(Vec::new()));
        let sink = accepted.clone();
        let listener = Listener::new(&server, 0, move |listener, request| {
            let endpoint = listener.create_endpoint_from_conn_request(request).unwrap();
            sink.lock().unwrap().push(endpoint);
        })
        .unwrap();

        Self {
            fabric,
            context,
            client,
            server,
            listener,
            accepted,
        }
    }

    pub fn port(&self) -> u16 {
        self.listener.port().unwrap()
    }

    /// Connects a client endpoint by hostname and returns it together with
    /// the server endpoint accepted for it.
    pub fn connect(&self) -> (Arc<Endpoint>, Arc<Endpoint>) {
        let before = self.accepted.lock().unwrap().len();
        let client = self
            .client
            .create_endpoint_from_hostname("127.0.0.1", self.port())
            .unwrap();
        assert!(self
            .server
            .progress_until(TIMEOUT, || self.accepted.lock().unwrap().len() > before));
        let server = self.accepted.lock().unwrap()[before].clone();
        (client, server)
    }

    /// Progresses both workers until `done` returns true.
    pub fn progress_until<F>(&self, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = std::time::Instant::now() + TIMEOUT;
        while std::time::Instant::now() < deadline {
            if done() {
                return true;
            }
            if self.client.progress() + self.server.progress() == 0 {
                std::thread::yield_now();
            }
        }
        done()
    }

    pub fn progress_both(&self) {
        self.client.progress();
        self.server.progress();
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let accepted = std::mem::take(
            &mut *self
                .accepted
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for endpoint in accepted {
            endpoint.close();
        }
        self.listener.close();
        self.client.shutdown();
        self.server.shutdown();
    }
}
