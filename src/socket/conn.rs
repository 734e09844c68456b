//! Managed connection: a buffered transport with an explicit lifecycle.
//!
//! A [`ManagedConnection`] is either OPEN or CLOSED. It starts OPEN and
//! becomes CLOSED through [`close`](ManagedConnection::close), a
//! [`read_line`](ManagedConnection::read_line) that hits end-of-stream or a
//! reset, or a failed deadline update inside
//! [`check_half_closed`](ManagedConnection::check_half_closed). Only
//! [`replace_stream`](ManagedConnection::replace_stream) reopens it.
//!
//! The transport is split into a read half (behind a `BufReader`) and a write
//! half so one reader and one writer can run at the same time. Closing from
//! any task wakes in-flight reads and writes, which then fail with
//! [`NetError::ConnectionClosed`].

use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::socket::stream::{Rewind, StreamSocket};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;

/// Buffered read half plus the bytes of a line that is still incomplete.
///
/// `partial` survives a `read_line` that was cut short by a deadline or a
/// close, so the next call resumes the same line.
struct ReadSide<S> {
    buf: BufReader<Rewind<ReadHalf<S>>>,
    partial: Vec<u8>,
}

impl<S: StreamSocket> ReadSide<S> {
    fn new(read_half: ReadHalf<S>) -> Self {
        Self {
            buf: BufReader::new(Rewind::new(read_half)),
            partial: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closed,
}

#[derive(Debug)]
struct ConnState {
    lifecycle: Lifecycle,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
}

impl ConnState {
    fn open<S: StreamSocket>(stream: &S) -> Self {
        Self {
            lifecycle: Lifecycle::Open,
            read_deadline: None,
            write_deadline: None,
            peer_addr: stream.peer_addr().ok(),
            local_addr: stream.local_addr().ok(),
        }
    }
}

/// Resolves once `rx` reports closed, or its sender is gone.
pub(crate) async fn closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// A buffered, shareable connection with idempotent close.
///
/// All methods take `&self`; wrap the connection in an `Arc` to use it from
/// several tasks. At most one task should read and one task should write at
/// a time.
pub struct ManagedConnection<S: StreamSocket = TcpStream> {
    reader: Mutex<Option<ReadSide<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    state: RwLock<ConnState>,
    closed_tx: watch::Sender<bool>,
}

impl<S: StreamSocket> ManagedConnection<S> {
    /// Read deadline used by [`check_half_closed`](Self::check_half_closed).
    pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1);

    /// Wrap an established stream. The connection starts OPEN.
    pub fn new(stream: S) -> Self {
        let state = ConnState::open(&stream);
        let (read_half, write_half) = tokio::io::split(stream);
        let (closed_tx, _) = watch::channel(false);
        Self {
            reader: Mutex::new(Some(ReadSide::new(read_half))),
            writer: Mutex::new(Some(write_half)),
            state: RwLock::new(state),
            closed_tx,
        }
    }

    fn state(&self) -> RwLockReadGuard<'_, ConnState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, ConnState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Install `stream` as the transport and reopen the connection.
    ///
    /// Buffered read data from the previous transport is discarded, including
    /// an unfinished line. This is
    /// a rebind, not a close: close the old transport first if it is still
    /// live. If the previous transport was never released, it is handed back
    /// to the caller.
    pub async fn replace_stream(&self, stream: S) -> Option<S> {
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;

        let state = ConnState::open(&stream);
        let (read_half, write_half) = tokio::io::split(stream);
        let old_reader = reader.replace(ReadSide::new(read_half));
        let old_writer = writer.replace(write_half);

        *self.state_mut() = state;
        self.closed_tx.send_replace(false);

        match (old_reader, old_writer) {
            (Some(r), Some(w)) => Some(r.buf.into_inner().into_inner().unsplit(w)),
            _ => None,
        }
    }

    /// Run a transport operation, bounded by `deadline` and by close.
    async fn guarded<T, F>(&self, deadline: Option<Instant>, op: F) -> Result<T, NetError>
    where
        F: Future<Output = io::Result<T>>,
    {
        let mut closed_rx = self.closed_tx.subscribe();
        let io = async {
            match deadline {
                Some(at) => match tokio::time::timeout_at(at, op).await {
                    Ok(res) => res.net_err(),
                    Err(_) => Err(NetError::ConnectionTimedOut),
                },
                None => op.await.net_err(),
            }
        };
        tokio::select! {
            res = io => res,
            _ = closed(&mut closed_rx) => Err(NetError::ConnectionClosed),
        }
    }

    /// Read buffered bytes into `buf`. `Ok(0)` means end-of-stream.
    ///
    /// Bytes of an unfinished line left by an interrupted
    /// [`read_line`](Self::read_line) come first. Does not change the
    /// lifecycle state.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, NetError> {
        let deadline = self.state().read_deadline;
        let mut guard = self.reader.lock().await;
        let side = guard.as_mut().ok_or(NetError::ConnectionClosed)?;
        if !side.partial.is_empty() {
            let n = buf.len().min(side.partial.len());
            buf[..n].copy_from_slice(&side.partial[..n]);
            side.partial.drain(..n);
            return Ok(n);
        }
        self.guarded(deadline, side.buf.read(buf)).await
    }

    /// Read up to and including the next `\n`.
    ///
    /// End-of-stream (including a partial line followed by end-of-stream) and
    /// connection resets close the connection before the error is returned.
    /// A timeout or close keeps the bytes read so far; the next call
    /// continues the same line.
    pub async fn read_line(&self) -> Result<String, NetError> {
        self.read_line_capped(usize::MAX).await
    }

    /// [`read_line`](Self::read_line) that gives up with
    /// [`NetError::ResponseHeadersTooBig`] once the line reaches `limit`
    /// bytes without a `\n`.
    pub(crate) async fn read_line_capped(&self, limit: usize) -> Result<String, NetError> {
        let deadline = self.state().read_deadline;
        let result = {
            let mut guard = self.reader.lock().await;
            match guard.as_mut() {
                Some(side) => self.fill_line(side, deadline, limit).await,
                None => Err(NetError::ConnectionClosed),
            }
        };

        if let Err(e) = &result {
            if e.is_disconnect() {
                tracing::debug!(peer = %self.remote_addr(), error = %e, "peer went away during read_line");
                self.close().await?;
            }
        }
        result
    }

    async fn fill_line(
        &self,
        side: &mut ReadSide<S>,
        deadline: Option<Instant>,
        limit: usize,
    ) -> Result<String, NetError> {
        let ReadSide { buf, partial } = side;
        let remaining = limit.saturating_sub(partial.len()) as u64;
        let mut limited = AsyncReadExt::take(&mut *buf, remaining);
        // read_until appends as it goes, so `partial` keeps whatever arrived
        // before a deadline or close cut the read short.
        self.guarded(deadline, limited.read_until(b'\n', partial))
            .await?;

        if partial.last() == Some(&b'\n') {
            let line = std::mem::take(partial);
            return String::from_utf8(line)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
                .net_err();
        }
        let too_big = partial.len() >= limit;
        partial.clear();
        if too_big {
            Err(NetError::ResponseHeadersTooBig)
        } else {
            Err(NetError::ConnectionClosed)
        }
    }

    /// Write `buf` straight to the transport.
    pub async fn write(&self, buf: &[u8]) -> Result<usize, NetError> {
        let deadline = self.state().write_deadline;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetError::ConnectionClosed)?;
        self.guarded(deadline, writer.write(buf)).await
    }

    /// Write all of `buf` to the transport.
    pub async fn write_all(&self, buf: &[u8]) -> Result<(), NetError> {
        let deadline = self.state().write_deadline;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetError::ConnectionClosed)?;
        self.guarded(deadline, writer.write_all(buf)).await
    }

    pub async fn write_str(&self, content: &str) -> Result<(), NetError> {
        self.write_all(content.as_bytes()).await
    }

    pub async fn flush(&self) -> Result<(), NetError> {
        let deadline = self.state().write_deadline;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetError::ConnectionClosed)?;
        self.guarded(deadline, writer.flush()).await
    }

    /// Close the connection. Idempotent and safe to race: only the first
    /// call releases the transport, every call returns `Ok(())`.
    pub async fn close(&self) -> Result<(), NetError> {
        if self.is_closed() {
            return Ok(());
        }
        // Wake in-flight reads and writes so they drop their locks.
        self.closed_tx.send_replace(true);

        // Same lock order as replace_stream: the state flip and the release
        // of the transport it describes happen together.
        let mut reader = self.reader.lock().await;
        let mut writer = self.writer.lock().await;
        {
            let mut state = self.state_mut();
            if state.lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            state.lifecycle = Lifecycle::Closed;
        }
        self.closed_tx.send_replace(true);

        if let Some(mut writer) = writer.take() {
            if let Err(e) = writer.shutdown().await {
                tracing::debug!(error = %e, "shutdown on close failed");
            }
        }
        reader.take();
        drop(writer);
        drop(reader);

        tracing::debug!(peer = %self.remote_addr(), "connection closed");
        Ok(())
    }

    /// Last observed lifecycle state. Advisory: the peer may have gone away
    /// since.
    pub fn is_closed(&self) -> bool {
        self.state().lifecycle == Lifecycle::Closed
    }

    /// Probe whether the peer has half-closed the connection.
    ///
    /// The caller must guarantee the peer is not sending during the probe.
    /// Only end-of-stream counts as closed; a timeout with no data, pending
    /// data, or any other transport error reports open. A byte that arrives
    /// during the probe is kept for the next read. If another task is reading,
    /// the probe reports open without touching the transport.
    pub async fn check_half_closed(&self) -> bool {
        if self.is_closed() {
            return true;
        }

        let previous = self.state().read_deadline;
        let probe_deadline = Instant::now() + Self::PROBE_TIMEOUT;
        if self.set_read_deadline(Some(probe_deadline)).is_err() {
            let _ = self.close().await;
            return true;
        }

        let eof = match self.reader.try_lock() {
            Ok(mut guard) => match guard.as_mut() {
                Some(side) => {
                    match tokio::time::timeout_at(probe_deadline, side.buf.get_mut().probe_eof()).await
                    {
                        Ok(Ok(eof)) => eof,
                        Ok(Err(e)) => {
                            tracing::debug!(error = %e, "half-close probe read failed");
                            false
                        }
                        Err(_) => false,
                    }
                }
                None => true,
            },
            Err(_) => false,
        };

        if eof {
            tracing::debug!(peer = %self.remote_addr(), "peer half-closed connection");
            let _ = self.close().await;
            return true;
        }

        if self.set_read_deadline(previous).is_err() {
            let _ = self.close().await;
            return true;
        }
        false
    }

    /// Remote endpoint, rendered as `ip:port`.
    pub fn remote_addr(&self) -> String {
        render_addr(self.state().peer_addr)
    }

    /// Local endpoint, rendered as `ip:port`.
    pub fn local_addr(&self) -> String {
        render_addr(self.state().local_addr)
    }

    pub fn peer_socket_addr(&self) -> Option<SocketAddr> {
        self.state().peer_addr
    }

    /// Set both read and write deadlines. `None` clears them.
    pub fn set_deadline(&self, deadline: Option<Instant>) -> Result<(), NetError> {
        let mut state = self.state_mut();
        if state.lifecycle == Lifecycle::Closed {
            return Err(NetError::SocketNotConnected);
        }
        state.read_deadline = deadline;
        state.write_deadline = deadline;
        Ok(())
    }

    /// Set the read deadline. `None` clears it.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) -> Result<(), NetError> {
        let mut state = self.state_mut();
        if state.lifecycle == Lifecycle::Closed {
            return Err(NetError::SocketNotConnected);
        }
        state.read_deadline = deadline;
        Ok(())
    }
}

fn render_addr(addr: Option<SocketAddr>) -> String {
    addr.map_or_else(|| "unknown".to_string(), |a| a.to_string())
}

impl<S: StreamSocket> From<S> for ManagedConnection<S> {
    fn from(stream: S) -> Self {
        Self::new(stream)
    }
}

impl<S: StreamSocket> fmt::Debug for ManagedConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("ManagedConnection")
            .field("peer_addr", &state.peer_addr)
            .field("local_addr", &state.local_addr)
            .field("lifecycle", &state.lifecycle)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::DuplexStream;

    fn pair() -> (DuplexStream, ManagedConnection<DuplexStream>) {
        let (peer, local) = tokio::io::duplex(1024);
        (peer, ManagedConnection::new(local))
    }

    #[tokio::test]
    async fn test_read_line_keeps_delimiter() {
        let (mut peer, conn) = pair();
        peer.write_all(b"hello\nworld\n").await.unwrap();

        assert_eq!(conn.read_line().await.unwrap(), "hello\n");
        assert_eq!(conn.read_line().await.unwrap(), "world\n");
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_read_line_partial_then_eof_closes() {
        let (mut peer, conn) = pair();
        peer.write_all(b"no newline").await.unwrap();
        drop(peer);

        let err = conn.read_line().await.unwrap_err();
        assert!(matches!(err, NetError::ConnectionClosed));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_plain_read_eof_does_not_close() {
        let (peer, conn) = pair();
        drop(peer);

        let mut buf = [0u8; 8];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_deadline_rejected_after_close() {
        let (_peer, conn) = pair();
        conn.close().await.unwrap();

        assert!(matches!(
            conn.set_read_deadline(None),
            Err(NetError::SocketNotConnected)
        ));
        assert!(matches!(
            conn.set_deadline(Some(Instant::now())),
            Err(NetError::SocketNotConnected)
        ));
    }

    #[tokio::test]
    async fn test_read_deadline_times_out() {
        let (_peer, conn) = pair();
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)))
            .unwrap();

        let mut buf = [0u8; 4];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert!(matches!(err, NetError::ConnectionTimedOut));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_write_deadline_bounds_blocked_write() {
        let (_peer, conn) = pair();
        conn.set_deadline(Some(Instant::now() + Duration::from_millis(30)))
            .unwrap();

        // Nobody drains the pipe, so the write parks once it is full.
        let err = conn.write_all(&[0u8; 4096]).await.unwrap_err();
        assert!(matches!(err, NetError::ConnectionTimedOut));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_read_serves_unfinished_line_first() {
        let (mut peer, conn) = pair();
        peer.write_all(b"par").await.unwrap();
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)))
            .unwrap();
        assert!(conn.read_line().await.is_err());

        peer.write_all(b"tial").await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(conn.read(&mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"par");
        conn.set_read_deadline(None).unwrap();
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"tial");
    }

    #[tokio::test]
    async fn test_capped_line_rejects_long_line() {
        let (mut peer, conn) = pair();
        peer.write_all(b"0123456789\n").await.unwrap();

        assert!(matches!(
            conn.read_line_capped(4).await,
            Err(NetError::ResponseHeadersTooBig)
        ));
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (_peer, conn) = pair();
        conn.close().await.unwrap();
        assert!(matches!(
            conn.write(b"x").await,
            Err(NetError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_duplex_addresses_render_unknown() {
        let (_peer, conn) = pair();
        assert_eq!(conn.remote_addr(), "unknown");
        assert_eq!(conn.local_addr(), "unknown");
        assert!(conn.peer_socket_addr().is_none());
    }
}
