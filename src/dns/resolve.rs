//! Resolver trait and name types.

use super::gai::SocketAddrs;
use crate::base::neterror::NetError;
use std::{collections::HashMap, fmt, future::Future, net::SocketAddr, pin::Pin, sync::Arc};

/// A host name to resolve into IP addresses.
#[derive(Clone, Hash, Eq, PartialEq)]
pub struct Name {
    host: Box<str>,
}

impl Name {
    /// Creates a new [`Name`] from any string-like type.
    #[inline]
    pub fn new(host: impl Into<Box<str>>) -> Self {
        Self { host: host.into() }
    }

    /// View the hostname as a string slice.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.host
    }
}

impl From<&str> for Name {
    fn from(value: &str) -> Self {
        Name::new(value)
    }
}

impl From<String> for Name {
    fn from(value: String) -> Self {
        Name::new(value)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.host, f)
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.host, f)
    }
}

/// Alias for an `Iterator` trait object over `SocketAddr`.
pub type Addrs = Box<dyn Iterator<Item = SocketAddr> + Send>;

/// Alias for the `Future` type returned by a DNS resolver.
pub type Resolving = Pin<Box<dyn Future<Output = Result<Addrs, NetError>> + Send>>;

/// Host name resolution.
///
/// Returned addresses normally carry port 0 and [`lookup`] stamps the
/// requested port on them. An answer with a non-zero port keeps it, which
/// lets an override pin a whole socket address.
pub trait Resolve: Send + Sync {
    fn resolve(&self, name: Name) -> Resolving;
}

impl<R: Resolve + ?Sized> Resolve for Arc<R> {
    fn resolve(&self, name: Name) -> Resolving {
        (**self).resolve(name)
    }
}

/// Resolve `host` and attach `port` to every address.
///
/// IP literals are returned directly without consulting the resolver.
pub async fn lookup(
    resolver: &dyn Resolve,
    host: &str,
    port: u16,
) -> Result<Vec<SocketAddr>, NetError> {
    // Bracketed IPv6 literals come straight out of URLs and host:port strings.
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Some(addrs) = SocketAddrs::try_parse(bare, port) {
        return Ok(addrs.collect());
    }

    let addrs: Vec<SocketAddr> = resolver
        .resolve(Name::new(bare))
        .await?
        .map(|mut addr| {
            if addr.port() == 0 {
                addr.set_port(port);
            }
            addr
        })
        .collect();

    if addrs.is_empty() {
        return Err(NetError::NameNotResolved);
    }
    Ok(addrs)
}

/// Resolver that answers fixed hostnames from a table before delegating.
///
/// Mostly useful in tests and for pinning a proxy host to a known address.
pub struct DnsResolverWithOverrides {
    inner: Arc<dyn Resolve>,
    overrides: Arc<HashMap<String, Vec<SocketAddr>>>,
}

impl DnsResolverWithOverrides {
    pub fn new(inner: Arc<dyn Resolve>, overrides: HashMap<String, Vec<SocketAddr>>) -> Self {
        Self {
            inner,
            overrides: Arc::new(overrides),
        }
    }
}

impl Resolve for DnsResolverWithOverrides {
    fn resolve(&self, name: Name) -> Resolving {
        if let Some(addrs) = self.overrides.get(name.as_str()) {
            let addrs: Addrs = Box::new(addrs.clone().into_iter());
            return Box::pin(std::future::ready(Ok(addrs)));
        }
        self.inner.resolve(name)
    }
}

impl fmt::Debug for DnsResolverWithOverrides {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsResolverWithOverrides")
            .field("override_count", &self.overrides.len())
            .finish_non_exhaustive()
    }
}
