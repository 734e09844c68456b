//! Transport abstraction.
//!
//! [`StreamSocket`] is the capability a [`ManagedConnection`] is built on:
//! an ordered byte channel that can report its endpoints. Plain TCP is the
//! production transport; in-memory duplex pipes stand in for it in tests.
//!
//! [`ManagedConnection`]: super::conn::ManagedConnection

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::TcpStream;

/// A connected, bidirectional byte transport.
pub trait StreamSocket: AsyncRead + AsyncWrite + Unpin + Send + Sync + fmt::Debug + 'static {
    /// Address of the remote endpoint.
    fn peer_addr(&self) -> io::Result<SocketAddr>;

    /// Address of the local endpoint.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl StreamSocket for TcpStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::peer_addr(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }
}

// In-memory pipes have no endpoints.
impl StreamSocket for DuplexStream {
    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Err(io::ErrorKind::NotConnected.into())
    }
}

/// Read adapter with a one-byte pushback slot.
///
/// Sits between the transport and the connection's `BufReader` so that a
/// liveness probe can read straight from the transport without losing a
/// byte: whatever the probe pulls off the wire is served by the next read.
#[derive(Debug)]
pub struct Rewind<R> {
    pending: Option<u8>,
    inner: R,
}

impl<R> Rewind<R> {
    pub fn new(inner: R) -> Self {
        Self {
            pending: None,
            inner,
        }
    }

    /// True if a probed byte is waiting to be read.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> Rewind<R> {
    /// Read at most one byte from the transport and keep it.
    ///
    /// Returns `Ok(true)` only on end-of-stream. Cancel safe: a byte is
    /// stored only once the underlying read has completed.
    pub async fn probe_eof(&mut self) -> io::Result<bool> {
        if self.pending.is_some() {
            return Ok(false);
        }
        let mut byte = [0u8; 1];
        if self.inner.read(&mut byte).await? == 0 {
            return Ok(true);
        }
        self.pending = Some(byte[0]);
        Ok(false)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Rewind<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if buf.remaining() > 0 {
            if let Some(byte) = self.pending.take() {
                buf.put_slice(&[byte]);
                return Poll::Ready(Ok(()));
            }
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
