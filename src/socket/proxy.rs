//! HTTP forward proxy settings.

use crate::base::neterror::NetError;
use url::Url;
use zeroize::Zeroizing;

/// Default port for an `http://` proxy URL without an explicit port.
pub const DEFAULT_PROXY_PORT: u16 = 80;

/// A parsed proxy URL with optional credentials.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Proxy URL (e.g., `http://proxy.com:8080`)
    pub url: Url,
    /// Proxy username for authentication
    pub username: Option<String>,
    /// Proxy password (zeroized on drop)
    pub password: Option<Zeroizing<String>>,
}

impl ProxySettings {
    /// Parse a proxy URL. User-info in the URL becomes the credentials.
    pub fn new(url_str: &str) -> Result<Self, NetError> {
        let url = Url::parse(url_str).map_err(|_| NetError::InvalidUrl)?;
        let username = Some(url.username())
            .filter(|u| !u.is_empty())
            .map(str::to_string);
        let password = url.password().map(|p| Zeroizing::new(p.to_string()));
        Ok(Self {
            url,
            username,
            password,
        })
    }

    /// Create proxy from environment variables.
    ///
    /// Checks `HTTP_PROXY` then `http_proxy`.
    pub fn from_env() -> Option<Self> {
        let url_str = std::env::var("HTTP_PROXY")
            .or_else(|_| std::env::var("http_proxy"))
            .ok()?;
        Self::new(&url_str).ok()
    }

    /// Replace the credentials.
    pub fn with_auth(mut self, user: &str, pass: &str) -> Self {
        self.username = Some(user.to_string());
        self.password = Some(Zeroizing::new(pass.to_string()));
        self
    }

    /// Reject anything but a plain `http://` proxy.
    pub fn ensure_http(&self) -> Result<(), NetError> {
        match self.url.scheme() {
            "http" => Ok(()),
            other => Err(NetError::UnsupportedProxyScheme {
                scheme: other.to_string(),
            }),
        }
    }

    /// `Proxy-Authorization` header value, if credentials are set.
    ///
    /// Encodes `user:password`, or just `user` when there is no password.
    pub fn auth_header(&self) -> Option<String> {
        use base64::{engine::general_purpose, Engine as _};
        let user = self.username.as_deref()?;
        let creds = match &self.password {
            Some(p) => Zeroizing::new(format!("{}:{}", user, p.as_str())),
            None => Zeroizing::new(user.to_string()),
        };
        let encoded = general_purpose::STANDARD.encode(creds.as_bytes());
        Some(format!("Basic {}", encoded))
    }

    /// Check if this proxy requires authentication.
    pub fn requires_auth(&self) -> bool {
        self.username.is_some()
    }

    /// Get proxy host and port.
    pub fn host_port(&self) -> Result<(&str, u16), NetError> {
        let host = self
            .url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or(NetError::InvalidUrl)?;
        let port = self.url.port().unwrap_or(DEFAULT_PROXY_PORT);
        Ok((host, port))
    }

    /// `host:port` of the proxy, ready to dial.
    pub fn dial_addr(&self) -> Result<String, NetError> {
        let (host, port) = self.host_port()?;
        Ok(format!("{}:{}", host, port))
    }
}

/// Builder for ProxySettings.
#[derive(Default)]
pub struct ProxyBuilder {
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set proxy URL.
    pub fn url(mut self, url: &str) -> Self {
        self.url = Some(url.to_string());
        self
    }

    /// Set an HTTP proxy by `host:port`.
    pub fn http(self, host_port: &str) -> Self {
        self.url(&format!("http://{}", host_port.trim_start_matches("http://")))
    }

    /// Set authentication, overriding any user-info in the URL.
    pub fn auth(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    pub fn build(self) -> Result<ProxySettings, NetError> {
        let url = self.url.ok_or(NetError::InvalidUrl)?;
        let settings = ProxySettings::new(&url)?;
        Ok(match (self.username, self.password) {
            (Some(user), Some(pass)) => settings.with_auth(&user, &pass),
            _ => settings,
        })
    }
}
