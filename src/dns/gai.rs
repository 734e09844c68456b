//! System resolver backed by `getaddrinfo`.
//!
//! Resolution runs on tokio's blocking pool so it never stalls the runtime.

use super::{Addrs, Name, Resolve, Resolving};
use crate::base::context::IoResultExt;
use crate::base::neterror::NetError;
use std::{
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    sync::Arc,
};

/// System DNS resolver using `getaddrinfo` in a thread pool.
#[derive(Clone, Debug, Default)]
pub struct GaiResolver;

impl GaiResolver {
    pub fn new() -> Self {
        Self
    }
}

impl Resolve for GaiResolver {
    fn resolve(&self, name: Name) -> Resolving {
        Box::pin(async move {
            let host = name.as_str().to_string();
            let domain = host.clone();

            let result = tokio::task::spawn_blocking(move || {
                tracing::debug!(host = %host, "resolving via getaddrinfo");
                (host.as_str(), 0u16)
                    .to_socket_addrs()
                    .map(|iter| iter.collect::<Vec<_>>())
            })
            .await;

            let addrs = result
                .map_err(|e| {
                    tracing::error!(error = %e, "DNS resolution task failed");
                    NetError::NameNotResolved
                })?
                .dns_context(&domain)
                .inspect_err(|e| tracing::debug!(domain = %domain, error = %e, "DNS resolution failed"))?;

            if addrs.is_empty() {
                return Err(NetError::NameNotResolvedFor {
                    domain,
                    source: Arc::new(io::Error::new(
                        io::ErrorKind::NotFound,
                        "No addresses returned by getaddrinfo",
                    )),
                });
            }

            tracing::debug!(domain = %domain, count = addrs.len(), "DNS resolution complete");
            Ok(Box::new(addrs.into_iter()) as Addrs)
        })
    }
}

/// Addresses parsed directly from an IP literal.
pub struct SocketAddrs {
    addrs: std::vec::IntoIter<SocketAddr>,
}

impl SocketAddrs {
    /// Returns `Some` if `host` is an IPv4 or IPv6 literal, `None` if it
    /// needs DNS.
    pub fn try_parse(host: &str, port: u16) -> Option<Self> {
        let ip: IpAddr = host.parse().ok()?;
        Some(Self {
            addrs: vec![SocketAddr::new(ip, port)].into_iter(),
        })
    }
}

impl Iterator for SocketAddrs {
    type Item = SocketAddr;

    fn next(&mut self) -> Option<Self::Item> {
        self.addrs.next()
    }
}
