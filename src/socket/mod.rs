//! Socket and connection management.
//!
//! - [`stream`]: transport capability and the probe pushback adapter
//! - [`conn`]: [`ManagedConnection`](conn::ManagedConnection), buffered connection with lifecycle
//! - [`listener`]: [`ConnectionListener`](listener::ConnectionListener), accept loop feeding a channel
//! - [`proxy`]: HTTP proxy settings
//! - [`connectjob`]: direct and proxied dialing

pub mod conn;
pub mod connectjob;
pub mod listener;
pub mod proxy;
pub mod stream;
