//! Integration tests: transfers through the watcher over real loopback TCP.
//!
//! Each test creates its own watcher, connects a socket pair, and drives
//! bytes through submitted requests while the peer side uses plain std I/O.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use edgeio::{OpKind, OpResult, RawStream, Watcher};

// ── Helpers ─────────────────────────────────────────────────────────────

/// A connected loopback pair: the watcher-side handle and the peer socket.
fn pair() -> (Arc<dyn RawStream>, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    let client = TcpStream::connect(addr).expect("connect");
    let (server, _) = listener.accept().expect("accept");
    server
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("peer timeout");
    let conn: Arc<dyn RawStream> = Arc::new(client);
    (conn, server)
}

/// Block for the next completion batch, failing the test after `timeout`.
fn wait_batch(watcher: &Arc<Watcher>, timeout: Duration) -> Vec<OpResult> {
    let (tx, rx) = mpsc::channel();
    let w = watcher.clone();
    thread::spawn(move || {
        let _ = tx.send(w.wait_io());
    });
    rx.recv_timeout(timeout)
        .expect("timed out waiting for a batch")
        .expect("watcher closed while waiting")
}

/// Collect results across batches until `count` have arrived.
fn wait_results(watcher: &Arc<Watcher>, count: usize, timeout: Duration) -> Vec<OpResult> {
    let deadline = Instant::now() + timeout;
    let mut results = Vec::new();
    while results.len() < count {
        let remaining = deadline.saturating_duration_since(Instant::now());
        assert!(
            !remaining.is_zero(),
            "timed out after {} of {count} results",
            results.len()
        );
        results.extend(wait_batch(watcher, remaining));
    }
    results
}

// ── Tests ───────────────────────────────────────────────────────────────

#[test]
fn echo_read_with_swap_buffer() {
    let watcher = Arc::new(Watcher::new(4096).expect("watcher"));
    let (conn, mut peer) = pair();

    peer.write_all(b"ABCDE").expect("peer write");
    watcher.read(1, &conn, None).expect("submit");

    let batch = wait_batch(&watcher, Duration::from_secs(5));
    assert_eq!(batch.len(), 1);
    let result = &batch[0];
    assert_eq!(result.op, OpKind::Read);
    assert_eq!(result.ctx, 1);
    assert_eq!(result.size, 5);
    assert_eq!(&result.buffer[..], b"ABCDE");
    assert!(result.err.is_none());
}

#[test]
fn echo_read_with_caller_buffer() {
    let watcher = Arc::new(Watcher::new(4096).expect("watcher"));
    let (conn, mut peer) = pair();

    watcher
        .read(2, &conn, Some(BytesMut::with_capacity(16)))
        .expect("submit");
    peer.write_all(b"hello").expect("peer write");

    let batch = wait_batch(&watcher, Duration::from_secs(5));
    assert_eq!(batch.len(), 1);
    let result = &batch[0];
    assert_eq!(result.ctx, 2);
    assert_eq!(result.size, 5);
    assert_eq!(&result.buffer[..], b"hello");
    assert!(result.err.is_none());
}

#[test]
fn write_reaches_peer() {
    let watcher = Arc::new(Watcher::new(4096).expect("watcher"));
    let (conn, mut peer) = pair();

    watcher
        .write(3, &conn, Bytes::from_static(b"pong"))
        .expect("submit");

    let batch = wait_batch(&watcher, Duration::from_secs(5));
    assert_eq!(batch.len(), 1);
    let result = &batch[0];
    assert_eq!(result.op, OpKind::Write);
    assert_eq!(result.ctx, 3);
    assert_eq!(result.size, 4);
    assert!(result.err.is_none());

    let mut buf = [0u8; 4];
    peer.read_exact(&mut buf).expect("peer read");
    assert_eq!(&buf, b"pong");
}

#[test]
fn large_write_completes_once_across_many_edges() {
    let watcher = Arc::new(Watcher::new(4096).expect("watcher"));
    let (conn, mut peer) = pair();

    const LEN: usize = 4 * 1024 * 1024;
    let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    watcher
        .write(4, &conn, Bytes::from(payload))
        .expect("submit");

    // Drain on the peer side so the socket keeps producing WRITABLE edges.
    let reader = thread::spawn(move || {
        let mut received = Vec::with_capacity(LEN);
        let mut chunk = vec![0u8; 64 * 1024];
        while received.len() < LEN {
            match peer.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => panic!("peer read error: {e}"),
            }
        }
        received
    });

    let batch = wait_batch(&watcher, Duration::from_secs(10));
    assert_eq!(batch.len(), 1, "partial writes must not produce completions");
    let result = &batch[0];
    assert_eq!(result.op, OpKind::Write);
    assert_eq!(result.ctx, 4);
    assert_eq!(result.size, LEN);
    assert!(result.err.is_none());

    let received = reader.join().expect("reader");
    assert_eq!(received, expected);
}

#[test]
fn reads_complete_in_submission_order() {
    let watcher = Arc::new(Watcher::new(4096).expect("watcher"));
    let (conn, mut peer) = pair();

    watcher.read(9, &conn, None).expect("submit first");
    watcher.read(10, &conn, None).expect("submit second");
    thread::sleep(Duration::from_millis(50));

    peer.write_all(b"abc").expect("peer write");
    let first = wait_results(&watcher, 1, Duration::from_secs(5));
    assert_eq!(first[0].ctx, 9);
    assert_eq!(&first[0].buffer[..], b"abc");

    peer.write_all(b"def").expect("peer write");
    let second = wait_results(&watcher, 1, Duration::from_secs(5));
    assert_eq!(second[0].ctx, 10);
    assert_eq!(&second[0].buffer[..], b"def");
}

#[test]
fn held_swap_views_are_not_clobbered() {
    // Tiny swap buffers so the two-buffer ring wraps quickly while the
    // consumer is still holding earlier views.
    let watcher = Arc::new(Watcher::new(8).expect("watcher"));
    let (conn, mut peer) = pair();

    let payloads: [&[u8]; 4] = [b"AAAA", b"BBBB", b"CCCC", b"DDDD"];
    let mut held = Vec::new();
    for (i, payload) in payloads.iter().enumerate() {
        peer.write_all(payload).expect("peer write");
        watcher.read(i as u64, &conn, None).expect("submit");
        let mut batch = wait_batch(&watcher, Duration::from_secs(5));
        assert_eq!(batch.len(), 1);
        let result = batch.remove(0);
        assert_eq!(result.ctx, i as u64);
        assert_eq!(&result.buffer[..], *payload);
        held.push(result);
    }

    for (result, payload) in held.iter().zip(payloads) {
        assert_eq!(&result.buffer[..], payload, "held view was mutated");
    }
}

#[test]
fn many_connections_no_loss() {
    const N: usize = 128;
    let watcher = Arc::new(Watcher::new(4096).expect("watcher"));
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");

    let mut conns: Vec<Arc<dyn RawStream>> = Vec::with_capacity(N);
    let mut peers = Vec::with_capacity(N);
    for _ in 0..N {
        let client = TcpStream::connect(addr).expect("connect");
        let (server, _) = listener.accept().expect("accept");
        conns.push(Arc::new(client));
        peers.push(server);
    }

    for (i, conn) in conns.iter().enumerate() {
        watcher.read(i as u64, conn, None).expect("submit");
    }
    for (i, peer) in peers.iter_mut().enumerate() {
        peer.write_all(format!("msg-{i:03}").as_bytes())
            .expect("peer write");
    }

    let results = wait_results(&watcher, N, Duration::from_secs(10));
    let mut seen = vec![false; N];
    for result in &results {
        assert!(result.err.is_none());
        let expected = format!("msg-{:03}", result.ctx);
        assert_eq!(&result.buffer[..], expected.as_bytes());
        assert!(
            !seen[result.ctx as usize],
            "duplicate completion for ctx {}",
            result.ctx
        );
        seen[result.ctx as usize] = true;
    }
    assert!(seen.iter().all(|&s| s), "missing completions");
}
