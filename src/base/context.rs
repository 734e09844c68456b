//! Error context helpers.
//!
//! Extension traits that turn `io::Result`s into `NetError`s, either by
//! classification alone or with the host / domain that was being reached.

use crate::base::neterror::NetError;
use std::io;
use std::sync::Arc;

/// Extension trait for adding context to IO Results.
pub trait IoResultExt<T> {
    /// Add connection context to an IO error.
    ///
    /// # Example
    /// ```ignore
    /// use netconn::base::context::IoResultExt;
    ///
    /// let stream = TcpStream::connect(addr).await
    ///     .connection_context("example.com", 443)?;
    /// // Error: "Connection to example.com:443 failed: connection refused"
    /// ```
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError>;

    /// Add DNS resolution context to an IO error.
    fn dns_context(self, domain: &str) -> Result<T, NetError>;

    /// Classify the error without extra context (see [`NetError::from_io`]).
    fn net_err(self) -> Result<T, NetError>;
}

impl<T> IoResultExt<T> for Result<T, io::Error> {
    fn connection_context(self, host: &str, port: u16) -> Result<T, NetError> {
        self.map_err(|e| NetError::ConnectionFailedTo {
            host: host.to_string(),
            port,
            source: Arc::new(e),
        })
    }

    fn dns_context(self, domain: &str) -> Result<T, NetError> {
        self.map_err(|e| NetError::NameNotResolvedFor {
            domain: domain.to_string(),
            source: Arc::new(e),
        })
    }

    fn net_err(self) -> Result<T, NetError> {
        self.map_err(NetError::from_io)
    }
}
