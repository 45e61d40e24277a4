//! Deferred submission queue drained by the progress thread.
//!
//! Application threads enqueue operations here instead of calling the
//! transport directly. The progress thread later runs each submission, so
//! the synchronous completion branch and any later transport callback for
//! a request both execute on the thread that owns progress.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::buffer::Buffer;
use crate::error::RequestError;
use crate::request::{OperationKind, Request};
use crate::transport::{EpHandle, Tag, Transport, WorkerHandle};

/// Work item executed on the progress lane.
pub type DelayedTask = Box<dyn FnOnce() + Send>;

/// Submission function selected by operation kind.
pub type SubmitFn = fn(DelayedPayload);

/// Everything a submission needs to reach the transport.
pub struct DelayedPayload {
    pub transport: Arc<dyn Transport>,
    pub worker: WorkerHandle,
    pub endpoint: EpHandle,
    pub kind: OperationKind,
    pub buffer: Buffer,
    pub length: usize,
    pub tag: Option<Tag>,
    pub request: Arc<Request>,
    /// Set when the endpoint had already failed; the request settles with
    /// this error instead of reaching the transport.
    pub preempt: Option<RequestError>,
}

impl fmt::Debug for DelayedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedPayload")
            .field("worker", &self.worker)
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind)
            .field("length", &self.length)
            .field("tag", &self.tag)
            .field("request", &self.request.id())
            .field("preempt", &self.preempt)
            .finish()
    }
}

/// FIFO of submissions deferred to the progress lane.
#[derive(Default)]
pub struct DelayedRequestQueue {
    queue: Mutex<VecDeque<DelayedTask>>,
}

impl DelayedRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `submit(payload)` for the next drain. Callable from any thread.
    pub fn register(&self, submit: SubmitFn, payload: DelayedPayload) {
        self.push(Box::new(move || submit(payload)));
    }

    /// Queues an already-bound task.
    pub fn push(&self, task: DelayedTask) {
        self.lock().push_back(task);
    }

    /// Runs everything queued so far in FIFO order. Tasks registered while
    /// draining wait for the next drain.
    pub fn drain(&self) -> usize {
        let tasks = std::mem::take(&mut *self.lock());
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DelayedTask>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
