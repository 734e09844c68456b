//! HTTP wire helpers.
//!
//! - [`connect`]: request/response head codec for CONNECT tunnels

pub mod connect;
