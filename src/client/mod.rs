//! Client library.
//!
//! [`TransportClient`] routes frames to named groups of connections;
//! [`ServiceClient`] dials those connections and keeps them alive.

mod service;
mod transport;

pub use service::*;
pub use transport::*;
