//! Submission functions run by the progress thread for each data transfer.

use std::sync::Arc;

use tracing::trace;

use crate::delayed::{DelayedPayload, SubmitFn};
use crate::request::{OperationKind, Request};
use crate::transport::{CompletionCallback, StreamRecvFlags, Submission, TAG_MASK_FULL};

impl OperationKind {
    pub(crate) fn submit_fn(self) -> SubmitFn {
        if self.is_tag() {
            submit_tag
        } else {
            submit_stream
        }
    }
}

fn completion_callback(request: &Arc<Request>) -> CompletionCallback {
    let request = Arc::clone(request);
    Box::new(move |status| {
        trace!(request = %request.id(), op = %request.kind(), %status, "{}_callback", request.kind());
        request.settle(status.translate());
    })
}

/// Settles preempted or already-cancelled requests; true if the payload
/// must not reach the transport.
fn preempted(payload: &mut DelayedPayload) -> bool {
    if let Some(error) = payload.preempt.take() {
        payload.request.settle(Err(error));
        return true;
    }
    payload.request.is_ready()
}

fn process(request: &Arc<Request>, submission: Submission) {
    match submission {
        Submission::Complete(status) => {
            request.settle(status.translate());
        }
        Submission::InFlight(op) => request.set_transport_handle(op),
    }
}

pub(crate) fn submit_tag(mut payload: DelayedPayload) {
    if preempted(&mut payload) {
        return;
    }
    let request = &payload.request;
    let tag = payload.tag.unwrap_or_default();
    let callback = completion_callback(request);
    let submission = if payload.kind.is_send() {
        payload
            .transport
            .tag_send_nb(payload.endpoint, &payload.buffer, tag, callback)
    } else {
        payload.transport.tag_recv_nb(
            payload.worker,
            &payload.buffer,
            tag,
            TAG_MASK_FULL,
            callback,
        )
    };
    trace!(
        request = %request.id(),
        op = %payload.kind,
        submission = ?submission,
        tag = format_args!("{:#x}", tag),
        size = payload.length,
        "submitted"
    );
    process(request, submission);
}

pub(crate) fn submit_stream(mut payload: DelayedPayload) {
    if preempted(&mut payload) {
        return;
    }
    let request = &payload.request;
    let callback = completion_callback(request);
    let submission = if payload.kind.is_send() {
        payload
            .transport
            .stream_send_nb(payload.endpoint, &payload.buffer, callback)
    } else {
        payload.transport.stream_recv_nb(
            payload.endpoint,
            &payload.buffer,
            StreamRecvFlags::WAITALL,
            callback,
        )
    };
    trace!(
        request = %request.id(),
        op = %payload.kind,
        submission = ?submission,
        size = payload.length,
        "submitted"
    );
    process(request, submission);
}
