//! DNS Resolution Module
//!
//! Address resolution is delegated to the environment. The [`Resolve`] trait
//! keeps it pluggable so dialers can be pointed at fixed answers in tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use netconn::dns::{lookup, GaiResolver};
//!
//! let addrs = lookup(&GaiResolver::new(), "example.com", 443).await?;
//! ```

mod gai;
mod resolve;

pub use gai::{GaiResolver, SocketAddrs};
pub use resolve::{lookup, Addrs, DnsResolverWithOverrides, Name, Resolve, Resolving};
