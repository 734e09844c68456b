//! Base types and error handling.
//!
//! - [`NetError`](neterror::NetError): network error codes shared by every module
//! - [`IoResultExt`](context::IoResultExt): context helpers for I/O results

pub mod context;
pub mod neterror;
