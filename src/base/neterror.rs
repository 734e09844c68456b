use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum NetError {
    // Connection Errors
    #[error("Connection closed (TCP FIN)")]
    ConnectionClosed,
    #[error("Connection reset (TCP RST)")]
    ConnectionReset,
    #[error("Connection refused")]
    ConnectionRefused,
    #[error("Connection failed")]
    ConnectionFailed,
    #[error("Connection to {host}:{port} failed: {source}")]
    ConnectionFailedTo {
        host: String,
        port: u16,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Name not resolved")]
    NameNotResolved,
    #[error("Name not resolved for {domain}: {source}")]
    NameNotResolvedFor {
        domain: String,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("Socket not connected")]
    SocketNotConnected,
    #[error("Address invalid")]
    AddressInvalid,
    #[error("Address in use")]
    AddressInUse,
    #[error("Tunnel connection failed with status {status}")]
    TunnelConnectionFailed { status: u16 },
    #[error("Connection timed out")]
    ConnectionTimedOut,

    // HTTP Errors
    #[error("Invalid URL")]
    InvalidUrl,
    #[error("Proxy URL scheme must be http, not [{scheme}]")]
    UnsupportedProxyScheme { scheme: String },
    #[error("Response headers too big")]
    ResponseHeadersTooBig,
    #[error("Invalid HTTP response")]
    InvalidHttpResponse,

    // Listener Errors
    #[error("Listener channel closed")]
    ListenerClosed,

    #[error("I/O error ({kind:?}): {source}")]
    Io {
        kind: io::ErrorKind,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Unknown error: {0}")]
    Unknown(i32),
}

impl NetError {
    pub fn as_i32(&self) -> i32 {
        match self {
            NetError::Io { .. } => -2,
            NetError::ConnectionClosed => -100,
            NetError::ConnectionReset => -101,
            NetError::ConnectionRefused => -102,
            NetError::ConnectionFailed | NetError::ConnectionFailedTo { .. } => -104,
            NetError::NameNotResolved | NetError::NameNotResolvedFor { .. } => -105,
            NetError::AddressInvalid => -108,
            NetError::TunnelConnectionFailed { .. } => -111,
            NetError::SocketNotConnected => -112,
            NetError::ConnectionTimedOut => -118,
            NetError::AddressInUse => -147,

            NetError::InvalidUrl => -300,
            NetError::UnsupportedProxyScheme { .. } => -301,
            NetError::ResponseHeadersTooBig => -325,
            NetError::InvalidHttpResponse => -370,
            // Custom codes start at -900
            NetError::ListenerClosed => -903,
            NetError::Unknown(code) => *code,
        }
    }

    /// Classify a transport error.
    ///
    /// Reset-like kinds collapse into [`NetError::ConnectionReset`] so that
    /// callers can test for a dead peer without matching on platform text.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => NetError::ConnectionReset,
            io::ErrorKind::UnexpectedEof => NetError::ConnectionClosed,
            io::ErrorKind::TimedOut => NetError::ConnectionTimedOut,
            io::ErrorKind::ConnectionRefused => NetError::ConnectionRefused,
            io::ErrorKind::NotConnected => NetError::SocketNotConnected,
            io::ErrorKind::AddrInUse => NetError::AddressInUse,
            io::ErrorKind::AddrNotAvailable => NetError::AddressInvalid,
            kind => NetError::Io {
                kind,
                source: Arc::new(err),
            },
        }
    }

    /// True when the peer is gone: end-of-stream or reset.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, NetError::ConnectionClosed | NetError::ConnectionReset)
    }

    /// Status code carried by a failed proxy handshake.
    pub fn tunnel_status(&self) -> Option<u16> {
        match self {
            NetError::TunnelConnectionFailed { status } => Some(*status),
            _ => None,
        }
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        NetError::from_io(err)
    }
}

/// Codes carry no payload, so detail fields (tunnel status, scheme, I/O
/// source) come back empty.
impl From<i32> for NetError {
    fn from(code: i32) -> Self {
        match code {
            -100 => NetError::ConnectionClosed,
            -101 => NetError::ConnectionReset,
            -102 => NetError::ConnectionRefused,
            -104 => NetError::ConnectionFailed,
            -105 => NetError::NameNotResolved,
            -108 => NetError::AddressInvalid,
            -111 => NetError::TunnelConnectionFailed { status: 0 },
            -112 => NetError::SocketNotConnected,
            -118 => NetError::ConnectionTimedOut,
            -147 => NetError::AddressInUse,

            -300 => NetError::InvalidUrl,
            -301 => NetError::UnsupportedProxyScheme {
                scheme: String::new(),
            },
            -325 => NetError::ResponseHeadersTooBig,
            -370 => NetError::InvalidHttpResponse,
            -903 => NetError::ListenerClosed,
            _ => NetError::Unknown(code),
        }
    }
}
