use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use crate::dns::{lookup, GaiResolver, Resolve};
use crate::http::connect::{connect_request, encode_request, read_response};
use crate::socket::conn::ManagedConnection;
use crate::socket::proxy::ProxySettings;
use http::StatusCode;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;

/// User-Agent sent with CONNECT requests unless overridden.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0";

/// Dial configuration.
#[derive(Clone)]
pub struct ConnectOptions {
    connect_timeout: Option<Duration>,
    user_agent: String,
    resolver: Arc<dyn Resolve>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            resolver: Arc::new(GaiResolver::new()),
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound each TCP connect attempt.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// User-Agent for proxy CONNECT requests.
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Resolver used for host names.
    pub fn resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.resolver = resolver;
        self
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("connect_timeout", &self.connect_timeout)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

/// Establishes outbound connections, directly or through an HTTP proxy.
#[derive(Debug, Clone, Default)]
pub struct ConnectJob {
    options: ConnectOptions,
}

impl ConnectJob {
    pub fn new(options: ConnectOptions) -> Self {
        Self { options }
    }

    /// Resolve and dial `addr` (`host:port`).
    ///
    /// Each resolved address is tried in order; the last failure is returned
    /// if none connects.
    pub async fn connect_direct(&self, addr: &str) -> Result<ManagedConnection, NetError> {
        let (host, port) = split_host_port(addr)?;
        let addrs = lookup(self.options.resolver.as_ref(), host, port).await?;

        let mut last_err = NetError::ConnectionFailed;
        for sock_addr in addrs {
            let attempt = TcpStream::connect(sock_addr);
            let result = match self.options.connect_timeout {
                Some(limit) => match tokio::time::timeout(limit, attempt).await {
                    Ok(res) => res.connection_context(host, port),
                    Err(_) => Err(NetError::ConnectionTimedOut),
                },
                None => attempt.await.connection_context(host, port),
            };
            match result {
                Ok(stream) => {
                    tracing::debug!(addr = %sock_addr, "connected");
                    return Ok(ManagedConnection::new(stream));
                }
                Err(e) => {
                    tracing::debug!(addr = %sock_addr, error = %e, "connect attempt failed");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Dial `target` (`host:port`) through the HTTP proxy at `proxy_url`.
    ///
    /// Only `http://` proxies are accepted; other schemes fail before any
    /// network activity. On success the returned connection carries the
    /// tunneled byte stream.
    pub async fn connect_via_http_proxy(
        &self,
        proxy_url: &str,
        target: &str,
    ) -> Result<ManagedConnection, NetError> {
        let proxy = ProxySettings::new(proxy_url)?;
        self.connect_via(&proxy, target).await
    }

    /// Same as [`connect_via_http_proxy`](Self::connect_via_http_proxy) with
    /// already-parsed settings.
    pub async fn connect_via(
        &self,
        proxy: &ProxySettings,
        target: &str,
    ) -> Result<ManagedConnection, NetError> {
        proxy.ensure_http()?;
        let auth = proxy.auth_header();
        let request = connect_request(target, auth.as_deref(), &self.options.user_agent)?;

        let conn = self.connect_direct(&proxy.dial_addr()?).await?;
        if let Err(e) = establish_tunnel(&conn, &encode_request(&request)).await {
            let _ = conn.close().await;
            return Err(e);
        }

        tracing::debug!(proxy = %conn.remote_addr(), target = %target, "tunnel established");
        Ok(conn)
    }
}

async fn establish_tunnel(conn: &ManagedConnection, request: &[u8]) -> Result<(), NetError> {
    conn.write_all(request).await?;
    conn.flush().await?;

    // Only the head is read; whatever body a refusal carries is discarded
    // with the connection.
    let response = read_response(conn).await?;
    if response.status() != StatusCode::OK {
        tracing::debug!(status = %response.status(), "proxy refused tunnel");
        return Err(NetError::TunnelConnectionFailed {
            status: response.status().as_u16(),
        });
    }
    Ok(())
}

/// Split `host:port`, accepting bracketed IPv6 hosts.
fn split_host_port(addr: &str) -> Result<(&str, u16), NetError> {
    let (host, port) = addr.rsplit_once(':').ok_or(NetError::AddressInvalid)?;
    let port = port.parse().map_err(|_| NetError::AddressInvalid)?;
    if host.is_empty() || (host.contains(':') && !host.starts_with('[')) {
        return Err(NetError::AddressInvalid);
    }
    Ok((host, port))
}

/// Dial `addr` with default options.
pub async fn connect_server(addr: &str) -> Result<ManagedConnection, NetError> {
    ConnectJob::default().connect_direct(addr).await
}

/// Dial `target` through `proxy_url` with default options.
pub async fn connect_server_by_http_proxy(
    proxy_url: &str,
    target: &str,
) -> Result<ManagedConnection, NetError> {
    ConnectJob::default()
        .connect_via_http_proxy(proxy_url, target)
        .await
}
