//! Server library.
//!
//! Accepts inbound sockets and wraps each one in a [`Connection`](crate::transport::Connection)
//! registered with the server's session manager.

#[allow(clippy::module_inception)]
mod server;

pub use server::*;
