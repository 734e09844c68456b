//! Managed Connection Tests
//!
//! Covers:
//! - Close idempotency under concurrent callers
//! - Lifecycle state across close / replace_stream
//! - Half-close probing (EOF, idle peer, data arriving during the probe)
//! - read_line closing on end-of-stream and on reset
//! - read_line resuming a line cut short by a deadline
//! - Close waking in-flight reads
//! - Close racing replace_stream

use netconn::{ManagedConnection, NetError, StreamSocket};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

/// Duplex pipe that counts how many times the transport is shut down.
#[derive(Debug)]
struct CountingStream {
    inner: DuplexStream,
    shutdowns: Arc<AtomicUsize>,
}

impl CountingStream {
    fn pair() -> (DuplexStream, Self, Arc<AtomicUsize>) {
        let (peer, inner) = tokio::io::duplex(1024);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let stream = Self {
            inner,
            shutdowns: shutdowns.clone(),
        };
        (peer, stream, shutdowns)
    }
}

impl AsyncRead for CountingStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for CountingStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl StreamSocket for CountingStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(io::ErrorKind::NotConnected.into())
    }
}

#[tokio::test]
async fn test_concurrent_close_releases_transport_once() {
    let (_peer, stream, shutdowns) = CountingStream::pair();
    let conn = Arc::new(ManagedConnection::new(stream));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = conn.clone();
        handles.push(tokio::spawn(async move { c.close().await }));
    }
    for h in handles {
        assert!(h.await.unwrap().is_ok());
    }

    assert!(conn.close().await.is_ok());
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    assert!(conn.is_closed());
}

#[tokio::test]
async fn test_closed_until_replaced() {
    let (_peer_a, stream_a, _) = CountingStream::pair();
    let conn = ManagedConnection::new(stream_a);
    assert!(!conn.is_closed());

    conn.close().await.unwrap();
    assert!(conn.is_closed());
    assert!(conn.is_closed());

    let (mut peer_b, stream_b, _) = CountingStream::pair();
    // The first transport was released by close, nothing to hand back.
    assert!(conn.replace_stream(stream_b).await.is_none());
    assert!(!conn.is_closed());

    peer_b.write_all(b"fresh\n").await.unwrap();
    assert_eq!(conn.read_line().await.unwrap(), "fresh\n");
}

#[tokio::test]
async fn test_replace_stream_returns_live_transport() {
    let (mut peer_a, stream_a, _) = CountingStream::pair();
    let conn = ManagedConnection::new(stream_a);

    // Buffered data from the old transport is discarded on rebind.
    peer_a.write_all(b"stale\nmore\n").await.unwrap();
    assert_eq!(conn.read_line().await.unwrap(), "stale\n");

    let (_peer_b, stream_b, _) = CountingStream::pair();
    let mut old = conn.replace_stream(stream_b).await.expect("old transport");

    old.write_all(b"still usable").await.unwrap();
    let mut buf = [0u8; 12];
    peer_a.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"still usable");
}

#[tokio::test]
async fn test_half_closed_peer_detected() {
    let (peer, stream, shutdowns) = CountingStream::pair();
    let conn = ManagedConnection::new(stream);
    drop(peer);

    assert!(conn.check_half_closed().await);
    assert!(conn.is_closed());
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

    // Already closed: answers without probing.
    assert!(conn.check_half_closed().await);
}

#[tokio::test]
async fn test_idle_peer_reports_open() {
    let (mut peer, stream, _) = CountingStream::pair();
    let conn = ManagedConnection::new(stream);

    assert!(!conn.check_half_closed().await);
    assert!(!conn.is_closed());

    // Still usable in both directions, with no deadline left behind.
    conn.write_str("ping\n").await.unwrap();
    let mut buf = [0u8; 5];
    peer.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping\n");

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        peer.write_all(b"pong\n").await.unwrap();
        peer
    });
    assert_eq!(conn.read_line().await.unwrap(), "pong\n");
}

#[tokio::test]
async fn test_probe_does_not_consume_application_bytes() {
    let (mut peer, stream, _) = CountingStream::pair();
    let conn = ManagedConnection::new(stream);

    // The peer breaks the quiescence contract; nothing may be lost.
    peer.write_all(b"xyz\n").await.unwrap();
    assert!(!conn.check_half_closed().await);
    assert!(!conn.check_half_closed().await);
    assert_eq!(conn.read_line().await.unwrap(), "xyz\n");
}

#[tokio::test]
async fn test_probe_keeps_previous_read_deadline() {
    let (_peer, stream, _) = CountingStream::pair();
    let conn = ManagedConnection::new(stream);
    conn.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(30)))
        .unwrap();

    assert!(!conn.check_half_closed().await);

    let mut buf = [0u8; 1];
    let err = timeout(Duration::from_secs(2), conn.read(&mut buf))
        .await
        .expect("read deadline should still apply")
        .unwrap_err();
    assert!(matches!(err, NetError::ConnectionTimedOut));
}

#[tokio::test]
async fn test_read_line_eof_marks_closed() {
    let (mut peer, stream, shutdowns) = CountingStream::pair();
    let conn = ManagedConnection::new(stream);

    peer.write_all(b"half a li").await.unwrap();
    drop(peer);

    assert!(conn.read_line().await.is_err());
    assert!(conn.is_closed());
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);

    // Later closes stay no-ops.
    conn.close().await.unwrap();
    assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_read_line_resumes_after_deadline() {
    let (mut peer, stream, _) = CountingStream::pair();
    let conn = ManagedConnection::new(stream);

    peer.write_all(b"hel").await.unwrap();
    conn.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_millis(30)))
        .unwrap();
    assert!(matches!(
        conn.read_line().await,
        Err(NetError::ConnectionTimedOut)
    ));
    assert!(!conn.is_closed());

    conn.set_read_deadline(None).unwrap();
    peer.write_all(b"lo\n").await.unwrap();
    assert_eq!(conn.read_line().await.unwrap(), "hello\n");
}

#[tokio::test]
#[allow(deprecated)]
async fn test_read_line_reset_marks_closed() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let client = TcpStream::connect(server.local_addr().unwrap())
        .await
        .unwrap();
    let (stream, _) = server.accept().await.unwrap();
    let conn = ManagedConnection::new(stream);

    // Zero linger turns the close into an RST.
    client.set_linger(Some(Duration::ZERO)).unwrap();
    drop(client);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = conn.read_line().await.unwrap_err();
    assert!(matches!(err, NetError::ConnectionReset), "unexpected error: {:?}", err);
    assert!(conn.is_closed());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_racing_replace_stays_consistent() {
    for _ in 0..50 {
        let (_peer_a, stream_a, _) = CountingStream::pair();
        let conn = Arc::new(ManagedConnection::new(stream_a));
        let (mut peer_b, stream_b, _) = CountingStream::pair();

        let closer = {
            let c = conn.clone();
            tokio::spawn(async move { c.close().await })
        };
        let rebinder = {
            let c = conn.clone();
            tokio::spawn(async move { c.replace_stream(stream_b).await })
        };
        closer.await.unwrap().unwrap();
        drop(rebinder.await.unwrap());

        // Whichever ran last wins, but state and transport must agree.
        if conn.is_closed() {
            assert!(matches!(
                conn.write_str("x").await,
                Err(NetError::ConnectionClosed)
            ));
        } else {
            conn.write_str("ok\n").await.unwrap();
            let mut buf = [0u8; 3];
            peer_b.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ok\n");
        }
    }
}

#[tokio::test]
async fn test_close_wakes_blocked_reader() {
    let (_peer, stream, _) = CountingStream::pair();
    let conn = Arc::new(ManagedConnection::new(stream));

    let reader = {
        let c = conn.clone();
        tokio::spawn(async move { c.read_line().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    conn.close().await.unwrap();

    let result = timeout(Duration::from_secs(2), reader)
        .await
        .expect("reader should be woken by close")
        .unwrap();
    assert!(matches!(result, Err(NetError::ConnectionClosed)));
}

#[tokio::test]
async fn test_tcp_addresses_and_echo() {
    let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let server_addr = server.local_addr().unwrap();

    let client = tokio::spawn(async move {
        let mut s = TcpStream::connect(server_addr).await.unwrap();
        s.write_all(b"hello\n").await.unwrap();
        let mut buf = [0u8; 6];
        s.read_exact(&mut buf).await.unwrap();
        buf
    });

    let (stream, peer) = server.accept().await.unwrap();
    let conn = ManagedConnection::new(stream);
    assert_eq!(conn.local_addr(), server_addr.to_string());
    assert_eq!(conn.remote_addr(), peer.to_string());

    let line = conn.read_line().await.unwrap();
    conn.write_all(line.as_bytes()).await.unwrap();
    assert_eq!(&client.await.unwrap(), b"hello\n");

    // Client is gone now; the probe sees the FIN.
    let mut closed = false;
    for _ in 0..50 {
        if conn.check_half_closed().await {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed);
}
