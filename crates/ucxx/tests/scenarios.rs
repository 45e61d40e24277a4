//! End-to-end client/server scenarios over the simulated fabric.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use common::{Harness, TIMEOUT};
use ucxx::{Buffer, Endpoint, Error, RequestError, RequestStatus, TransportStatus};

#[test]
fn test_tag_send_recv_over_hostname() {
    let harness = Harness::new();
    let (client, server) = harness.connect();

    let payload = vec![0xde, 0xad, 0xbe, 0xef, 1, 2, 3, 4];
    let recv_buf = Buffer::zeroed(8);
    let recv = server.tag_recv(recv_buf.clone(), 0xCAFE).unwrap();
    let send = client.tag_send(Buffer::from(payload.clone()), 0xCAFE).unwrap();

    assert!(harness.progress_until(|| send.is_ready() && recv.is_ready()));
    assert_eq!(send.wait(), Ok(()));
    assert_eq!(recv.wait(), Ok(()));
    assert_eq!(recv_buf.to_vec(), payload);
    assert_eq!(client.inflight_count(), 0);
    assert_eq!(server.inflight_count(), 0);
}

#[test]
fn test_connection_reset_cancels_all_pending() {
    let harness = Harness::new();
    let (client, _server) = harness.connect();

    let recvs: Vec<_> = (1..=3)
        .map(|tag| client.tag_recv(Buffer::zeroed(16), tag).unwrap())
        .collect();
    harness.client.progress();
    assert!(recvs.iter().all(|r| !r.is_ready()));
    assert_eq!(client.inflight_count(), 3);

    harness
        .fabric
        .inject_error(client.handle().unwrap(), TransportStatus::ConnectionReset);
    harness.client.progress();

    for recv in &recvs {
        assert_eq!(recv.status(), Some(Err(RequestError::ConnectionReset)));
    }
    assert_eq!(client.inflight_count(), 0);
    assert!(!client.is_alive());
    assert!(matches!(
        client.raise_on_error(),
        Err(Error::ConnectionReset(_))
    ));
}

#[test]
fn test_stream_recv_waits_for_full_length() {
    let harness = Harness::new();
    let (client, server) = harness.connect();

    let recv_buf = Buffer::zeroed(1024);
    let recv = server.stream_recv(recv_buf.clone()).unwrap();
    harness.server.progress();

    let first = client.stream_send(Buffer::from(vec![1u8; 512])).unwrap();
    assert!(harness.progress_until(|| first.is_ready()));
    harness.progress_both();
    assert!(!recv.is_ready());

    let second = client.stream_send(Buffer::from(vec![2u8; 512])).unwrap();
    assert!(harness.progress_until(|| second.is_ready() && recv.is_ready()));
    assert_eq!(recv.wait(), Ok(()));

    let data = recv_buf.to_vec();
    assert!(data[..512].iter().all(|b| *b == 1));
    assert!(data[512..].iter().all(|b| *b == 2));
}

#[test]
fn test_hostname_resolution_failure_allocates_nothing() {
    let harness = Harness::new();
    let before = harness.fabric.endpoint_count();
    let result = Endpoint::from_hostname(&harness.client, "no.such.host.invalid", 9000, true);
    assert!(matches!(result, Err(Error::InvalidAddress(_))));
    assert_eq!(harness.fabric.endpoint_count(), before);
    assert_eq!(harness.fabric.stats().endpoints_created, 0);
}

#[test]
fn test_close_cancels_inflight_and_fires_callback_once() {
    let harness = Harness::new();
    let (client, _server) = harness.connect();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    client.set_close_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let a = client.tag_recv(Buffer::zeroed(4), 10).unwrap();
    let b = client.tag_recv(Buffer::zeroed(4), 11).unwrap();
    harness.client.progress();
    assert_eq!(client.inflight_count(), 2);

    client.close();
    assert_eq!(a.status(), Some(Err(RequestError::Cancelled)));
    assert_eq!(b.status(), Some(Err(RequestError::Cancelled)));
    assert_eq!(client.inflight_count(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    drop(client);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.fabric.stats().endpoints_closed, 1);
}

#[test]
fn test_dropped_endpoint_closes_when_last_request_settles() {
    let harness = Harness::new();
    let (client, server) = harness.connect();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    client.set_close_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let recv_buf = Buffer::zeroed(4);
    let recv = client.tag_recv(recv_buf.clone(), 0x51).unwrap();
    harness.client.progress();
    assert!(!recv.is_ready());

    // The pending request now holds the only reference.
    drop(client);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.fabric.stats().endpoints_closed, 0);

    let send = server.tag_send(Buffer::from(vec![5u8; 4]), 0x51).unwrap();
    assert!(harness.progress_until(|| send.is_ready() && recv.is_ready()));
    assert_eq!(recv.wait(), Ok(()));
    assert_eq!(recv_buf.to_vec(), vec![5; 4]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.fabric.stats().endpoints_closed, 1);
}

#[test]
fn test_error_is_isolated_to_one_endpoint() {
    let harness = Harness::new();
    let (ep_a, _server_a) = harness.connect();
    let (ep_b, server_b) = harness.connect();

    let recv_a = ep_a.tag_recv(Buffer::zeroed(4), 100).unwrap();
    let recv_b_buf = Buffer::zeroed(4);
    let recv_b = ep_b.tag_recv(recv_b_buf.clone(), 200).unwrap();
    harness.client.progress();

    harness
        .fabric
        .inject_error(ep_a.handle().unwrap(), TransportStatus::ConnectionReset);
    harness.client.progress();

    assert_eq!(recv_a.status(), Some(Err(RequestError::ConnectionReset)));
    assert!(!recv_b.is_ready());
    assert!(ep_b.is_alive());

    let send = server_b.tag_send(Buffer::from(vec![9u8; 4]), 200).unwrap();
    assert!(harness.progress_until(|| send.is_ready() && recv_b.is_ready()));
    assert_eq!(recv_b.wait(), Ok(()));
    assert_eq!(recv_b_buf.to_vec(), vec![9; 4]);
    assert!(!ep_a.is_alive());
}

#[test]
fn test_peer_close_resets_remote_and_callback_stays_single() {
    let harness = Harness::new();
    let (client, server) = harness.connect();
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    client.set_close_callback(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let pending = client.stream_recv(Buffer::zeroed(64)).unwrap();
    harness.client.progress();

    server.close();
    assert!(harness.progress_until(|| pending.is_ready()));
    assert_eq!(pending.wait(), Err(RequestError::ConnectionReset));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.close();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_submission_order_is_preserved() {
    let harness = Harness::new();
    let (client, server) = harness.connect();

    let chunks: Vec<Vec<u8>> = (0u8..8).map(|i| vec![i; 16]).collect();
    let sends: Vec<_> = chunks
        .iter()
        .map(|chunk| client.stream_send(Buffer::from(chunk.clone())).unwrap())
        .collect();
    let recv_buf = Buffer::zeroed(16 * chunks.len());
    let recv = server.stream_recv(recv_buf.clone()).unwrap();

    assert!(harness.progress_until(|| recv.is_ready() && sends.iter().all(|s| s.is_ready())));
    assert_eq!(recv_buf.to_vec(), chunks.concat());

    let tag_bufs: Vec<Buffer> = (0..4).map(|_| Buffer::zeroed(1)).collect();
    let tag_recvs: Vec<_> = tag_bufs
        .iter()
        .map(|buf| server.tag_recv(buf.clone(), 7).unwrap())
        .collect();
    for i in 0u8..4 {
        client.tag_send(Buffer::from(vec![i]), 7).unwrap();
    }
    assert!(harness.progress_until(|| tag_recvs.iter().all(|r| r.is_ready())));
    let received: Vec<u8> = tag_bufs.iter().map(|buf| buf.to_vec()[0]).collect();
    assert_eq!(received, vec![0, 1, 2, 3]);
}

#[test]
fn test_callbacks_run_on_progress_thread() {
    let harness = Harness::new();
    let (client, server) = harness.connect();
    harness.client.start_progress_thread().unwrap();
    harness.server.start_progress_thread().unwrap();

    let threads = Arc::new(Mutex::new(Vec::new()));
    let record = |threads: &Arc<Mutex<Vec<Option<String>>>>| {
        let threads = threads.clone();
        move |_status: RequestStatus| {
            threads
                .lock()
                .unwrap()
                .push(thread::current().name().map(str::to_string));
        }
    };

    let recv = server
        .tag_recv_with_callback(Buffer::zeroed(8), 0xCAFE, record(&threads))
        .unwrap();
    let send = client
        .tag_send_with_callback(Buffer::zeroed(8), 0xCAFE, record(&threads))
        .unwrap();
    let doomed = client
        .stream_recv_with_callback(Buffer::zeroed(8), record(&threads))
        .unwrap();

    assert_eq!(send.wait_timeout(TIMEOUT), Some(Ok(())));
    assert_eq!(recv.wait_timeout(TIMEOUT), Some(Ok(())));

    harness
        .fabric
        .inject_error(client.handle().unwrap(), TransportStatus::EndpointTimeout);
    assert_eq!(
        doomed.wait_timeout(TIMEOUT),
        Some(Err(RequestError::EndpointTimeout))
    );

    // Signals settle before user callbacks run.
    let deadline = std::time::Instant::now() + TIMEOUT;
    while threads.lock().unwrap().len() < 3 && std::time::Instant::now() < deadline {
        thread::yield_now();
    }
    let names = threads.lock().unwrap().clone();
    assert_eq!(names.len(), 3);
    assert!(names
        .iter()
        .all(|name| name.as_deref() == Some("ucxx-progress")));

    harness.client.stop_progress_thread();
    harness.server.stop_progress_thread();
}

#[tokio::test]
async fn test_async_completion() {
    let harness = Harness::new();
    let (client, server) = harness.connect();
    harness.client.start_progress_thread().unwrap();
    harness.server.start_progress_thread().unwrap();

    let recv_buf = Buffer::zeroed(3);
    let recv = server.tag_recv(recv_buf.clone(), 42).unwrap();
    let send = client.tag_send(Buffer::from(vec![7u8, 8, 9]), 42).unwrap();

    let status = tokio::time::timeout(TIMEOUT, async {
        send.completed().await?;
        recv.completed().await
    })
    .await
    .expect("request did not complete in time");
    assert_eq!(status, Ok(()));
    assert_eq!(recv_buf.to_vec(), vec![7, 8, 9]);
}
