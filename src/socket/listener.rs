//! Channel-backed TCP listener.
//!
//! [`ConnectionListener::bind`] starts one background task that accepts
//! sockets, wraps each in a [`ManagedConnection`] and hands it over a
//! capacity-1 channel. When nobody is calling [`accept`](ConnectionListener::accept)
//! the task parks on the send, so at most one accepted connection waits in
//! the channel.

use crate::base::neterror::NetError;
use crate::dns::{lookup, GaiResolver};
use crate::socket::conn::{closed, ManagedConnection};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// A bound listener that delivers accepted connections through a channel.
#[derive(Debug)]
pub struct ConnectionListener {
    local_addr: SocketAddr,
    accepted: Mutex<mpsc::Receiver<ManagedConnection>>,
    closed: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    accept_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionListener {
    /// Resolve `bind_addr`, bind `bind_port` and start accepting.
    ///
    /// An empty `bind_addr` binds every interface. Returns as soon as the
    /// socket is listening; it does not wait for a first client.
    pub async fn bind(bind_addr: &str, bind_port: u16) -> Result<Self, NetError> {
        let host = if bind_addr.is_empty() { "0.0.0.0" } else { bind_addr };
        let addrs = lookup(&GaiResolver::new(), host, bind_port).await?;

        let mut last_err = NetError::AddressInvalid;
        let mut bound = None;
        for addr in addrs {
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    bound = Some(listener);
                    break;
                }
                Err(e) => last_err = NetError::from_io(e),
            }
        }
        let listener = bound.ok_or(last_err)?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, tx, shutdown_rx));

        tracing::debug!(addr = %local_addr, "listener bound");
        Ok(Self {
            local_addr,
            accepted: Mutex::new(rx),
            closed: AtomicBool::new(false),
            shutdown_tx,
            accept_task: std::sync::Mutex::new(Some(accept_task)),
        })
    }

    /// The address the listener is bound to (with the real port when bound to 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next accepted connection.
    ///
    /// Returns [`NetError::ListenerClosed`] once the listener has been closed,
    /// including for callers already waiting when [`close`](Self::close) runs.
    pub async fn accept(&self) -> Result<ManagedConnection, NetError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        if self.is_closed() {
            if let Ok(mut accepted) = self.accepted.try_lock() {
                drain(&mut accepted);
            }
            return Err(NetError::ListenerClosed);
        }

        let mut accepted = tokio::select! {
            rx = self.accepted.lock() => rx,
            _ = closed(&mut shutdown_rx) => return Err(NetError::ListenerClosed),
        };

        tokio::select! {
            conn = accepted.recv() => match conn {
                Some(conn) if !self.is_closed() => return Ok(conn),
                // A connection queued before close is dropped, not delivered.
                _ => {}
            },
            _ = closed(&mut shutdown_rx) => {}
        }
        // close() cannot drain while this call holds the receiver.
        drain(&mut accepted);
        Err(NetError::ListenerClosed)
    }

    /// Stop accepting. Only the first call has any effect.
    ///
    /// The accept task releases the listening socket before the delivery
    /// channel is closed, so the task can never send into a closed channel.
    pub async fn close(&self) -> Result<(), NetError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown_tx.send_replace(true);

        let task = self
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "accept task ended abnormally");
            }
        }

        // A waiting accept() holds the receiver and drains it on its way out.
        if let Ok(mut accepted) = self.accepted.try_lock() {
            drain(&mut accepted);
        }

        tracing::debug!(addr = %self.local_addr, "listener closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Close the delivery channel and drop whatever is still queued, which
/// closes those sockets.
fn drain(accepted: &mut mpsc::Receiver<ManagedConnection>) {
    accepted.close();
    while let Ok(conn) = accepted.try_recv() {
        tracing::debug!(peer = %conn.remote_addr(), "dropping undelivered connection");
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<ManagedConnection>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = closed(&mut shutdown_rx) => break,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                if *shutdown_rx.borrow() {
                    break;
                }
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };

        tracing::debug!(peer = %peer, "accepted connection");
        let conn = ManagedConnection::new(stream);
        tokio::select! {
            sent = tx.send(conn) => {
                if sent.is_err() {
                    break;
                }
            }
            _ = closed(&mut shutdown_rx) => break,
        }
    }
    drop(listener);
    tracing::debug!("accept loop stopped");
}
