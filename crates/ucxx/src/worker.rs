//! Progress engine wrapper.
//!
//! A [`Worker`] owns a transport worker handle, the delayed submission
//! queue and the list of inflight registries awaiting cancellation. One
//! call to [`Worker::progress`] is one progress cycle:
//!
//! 1. run cancellations scheduled since the last cycle,
//! 2. drain the delayed submission queue,
//! 3. progress the transport (completion and error callbacks run here),
//! 4. run cancellations scheduled by those callbacks.
//!
//! Cycles are serialised by a re-entrant lock, so an endpoint torn down from
//! inside a completion callback can spin progress on the same thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::ReentrantMutex;
use tracing::{debug, warn};

use crate::address::Address;
use crate::config::ProgressMode;
use crate::context::Context;
use crate::delayed::{DelayedPayload, DelayedRequestQueue, SubmitFn};
use crate::endpoint::Endpoint;
use crate::error::{Error, RequestError, Result};
use crate::inflight::InflightRegistry;
use crate::signal::CompletionSignal;
use crate::transport::{Transport, WorkerHandle};

const PROGRESS_THREAD_NAME: &str = "ucxx-progress";

struct ProgressThread {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Progress engine for a set of endpoints.
///
/// Completions, error callbacks and deferred submissions all run inside
/// [`progress`](Self::progress).
pub struct Worker {
    context: Arc<Context>,
    handle: Mutex<Option<WorkerHandle>>,
    delayed: DelayedRequestQueue,
    pending_cancels: Mutex<VecDeque<(Arc<InflightRegistry>, RequestError)>>,
    /// Registries of endpoints created on this worker, cancelled on shutdown.
    registries: Mutex<Vec<Weak<InflightRegistry>>>,
    progress_lock: ReentrantMutex<()>,
    progress_thread: Mutex<Option<ProgressThread>>,
}

impl Worker {
    /// Creates a transport worker on `context`.
    pub fn new(context: &Arc<Context>) -> Result<Arc<Self>> {
        let handle = context
            .transport()
            .worker_create()
            .map_err(Error::transport)?;
        debug!(worker = %handle, "worker created");
        Ok(Arc::new(Self {
            context: Arc::clone(context),
            handle: Mutex::new(Some(handle)),
            delayed: DelayedRequestQueue::new(),
            pending_cancels: Mutex::new(VecDeque::new()),
            registries: Mutex::new(Vec::new()),
            progress_lock: ReentrantMutex::new(()),
            progress_thread: Mutex::new(None),
        }))
    }

    /// Transport handle; `None` once the worker has been shut down.
    pub fn handle(&self) -> Option<WorkerHandle> {
        *lock(&self.handle)
    }

    /// Context this worker was created from.
    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// Transport shared with the context.
    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(self.context.transport())
    }

    /// Fresh signal for a request submitted on this worker.
    pub fn new_completion_signal(&self) -> CompletionSignal {
        CompletionSignal::new()
    }

    /// Serialised address peers use with
    /// [`Endpoint::from_worker_address`](crate::endpoint::Endpoint::from_worker_address).
    pub fn address(&self) -> Result<Address> {
        let handle = self
            .handle()
            .ok_or_else(|| Error::NotInitialized("worker".to_string()))?;
        let bytes = self
            .transport()
            .worker_address(handle)
            .map_err(Error::transport)?;
        Ok(Address::from_bytes(bytes))
    }

    /// Connects to a listener at `hostname:port` with the configured
    /// endpoint error handling.
    pub fn create_endpoint_from_hostname(
        self: &Arc<Self>,
        hostname: &str,
        port: u16,
    ) -> Result<Arc<Endpoint>> {
        let error_handling = self.context.config().endpoint_error_handling;
        Endpoint::from_hostname(self, hostname, port, error_handling)
    }

    /// Connects directly to a peer worker with the configured endpoint error
    /// handling.
    pub fn create_endpoint_from_worker_address(
        self: &Arc<Self>,
        address: &Address,
    ) -> Result<Arc<Endpoint>> {
        let error_handling = self.context.config().endpoint_error_handling;
        Endpoint::from_worker_address(self, address, error_handling)
    }

    /// Runs one progress cycle; returns the number of events handled.
    pub fn progress(&self) -> usize {
        let _guard = self.progress_lock.lock();
        let mut events = self.run_pending_cancels();
        events += self.delayed.drain();
        if let Some(handle) = self.handle() {
            events += self.transport().worker_progress(handle);
        }
        events + self.run_pending_cancels()
    }

    /// Progresses until `done` returns true or `timeout` elapses.
    pub fn progress_until<F>(&self, timeout: Duration, mut done: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if self.progress() == 0 {
                thread::yield_now();
            }
        }
    }

    /// Queues `submit(payload)` for the progress thread.
    pub fn register_delayed(&self, submit: SubmitFn, payload: DelayedPayload) {
        self.delayed.register(submit, payload);
    }

    pub(crate) fn register_task<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.delayed.push(Box::new(task));
    }

    /// Schedules `registry.cancel_all(error)` on the progress lane. Requests
    /// are processed in scheduling order; scheduling an already drained
    /// registry again is harmless.
    pub fn schedule_request_cancel(&self, registry: Arc<InflightRegistry>, error: RequestError) {
        lock(&self.pending_cancels).push_back((registry, error));
    }

    /// Tracks an endpoint's registry so shutdown can settle what it holds.
    pub(crate) fn register_inflight(&self, registry: &Arc<InflightRegistry>) {
        let mut registries = lock(&self.registries);
        registries.retain(|weak| weak.strong_count() > 0);
        registries.push(Arc::downgrade(registry));
    }

    fn run_pending_cancels(&self) -> usize {
        let pending = std::mem::take(&mut *lock(&self.pending_cancels));
        pending
            .into_iter()
            .map(|(registry, error)| registry.cancel_all(error))
            .sum()
    }

    /// Spawns the background progress thread. A no-op if it is running.
    pub fn start_progress_thread(self: &Arc<Self>) -> Result<()> {
        let mut slot = lock(&self.progress_thread);
        if slot.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let weak: Weak<Worker> = Arc::downgrade(self);
        let mode = self.context.config().progress_mode;
        let interval = Duration::from_micros(self.context.config().progress_interval_us);
        let thread_stop = stop.clone();
        let join = thread::Builder::new()
            .name(PROGRESS_THREAD_NAME.to_string())
            .spawn(move || progress_loop(weak, thread_stop, mode, interval))?;

        debug!(?mode, "progress thread started");
        *slot = Some(ProgressThread { stop, join });
        Ok(())
    }

    /// Stops and joins the progress thread. No-op if none is running, and does
    /// not join when called from the thread itself.
    pub fn stop_progress_thread(&self) {
        let Some(progress) = lock(&self.progress_thread).take() else {
            return;
        };
        progress.stop.store(true, Ordering::SeqCst);
        if progress.join.thread().id() == thread::current().id() {
            return;
        }
        if progress.join.join().is_err() {
            warn!("progress thread panicked");
        }
        debug!("progress thread stopped");
    }

    /// True between start and stop of the progress thread.
    pub fn is_progress_thread_running(&self) -> bool {
        lock(&self.progress_thread).is_some()
    }

    /// Stops the progress thread, flushes queued work, cancels every request
    /// still in flight on this worker's endpoints and destroys the transport
    /// worker. Endpoint creation fails afterwards.
    pub fn shutdown(&self) {
        self.stop_progress_thread();
        self.progress();
        let _guard = self.progress_lock.lock();
        if self.handle().is_none() {
            return;
        }

        let registries = std::mem::take(&mut *lock(&self.registries));
        let cancelled: usize = registries
            .iter()
            .filter_map(Weak::upgrade)
            .map(|registry| registry.cancel_all(RequestError::Cancelled))
            .sum();
        if cancelled > 0 {
            debug!(cancelled, "cancelled requests at worker shutdown");
            self.progress();
        }

        if let Some(handle) = lock(&self.handle).take() {
            self.transport().worker_destroy(handle);
            debug!(worker = %handle, "worker destroyed");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn progress_loop(worker: Weak<Worker>, stop: Arc<AtomicBool>, mode: ProgressMode, interval: Duration) {
    while !stop.load(Ordering::SeqCst) {
        let Some(worker) = worker.upgrade() else {
            break;
        };
        let events = worker.progress();
        drop(worker);
        if events == 0 {
            match mode {
                ProgressMode::Polling => thread::yield_now(),
                ProgressMode::Sleeping => thread::sleep(interval),
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
