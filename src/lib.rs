//! # wirepool
//!
//! A TCP connection framework: length-prefixed binary frames with heartbeats,
//! per-connection receive/transmit/dispatch duties, sharded session registries
//! and named groups of outbound connections with round-robin and broadcast
//! delivery.
//!
//! Applications supply only a [`NetworkCallback`](transport::NetworkCallback);
//! the crate owns sockets, queues, heartbeats, teardown and reconnects.
//!
//! ## Feature Flags
//!
//! - `transport` (default): frames, codec, connections, session manager
//! - `server` (default): accept loop ([`server::Server`])
//! - `client` (default): named groups and dialing ([`client::TransportClient`],
//!   [`client::ServiceClient`])
//!
//! ## Modules
//!
//! - [`core`]: constants, error types and identifier allocation (always included)
//! - [`transport`]: wire format and connection lifecycle
//! - [`server`]: inbound side
//! - [`client`]: outbound side
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! use wirepool::prelude::*;
//!
//! struct Echo;
//!
//! impl NetworkCallback for Echo {
//!     fn on_message(&self, conn: &Arc<Connection>, frame: Frame) -> Result<(), HandlerError> {
//!         conn.write(frame)?;
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> TransportResult<()> {
//! let config = ServerBuilder::new()
//!     .bind_addr("127.0.0.1:8888".parse().unwrap())
//!     .build();
//! let sessions = |_id: u64, _peer: SocketAddr| Arc::new(Echo) as Arc<dyn NetworkCallback>;
//! let server = Server::listen(config, CommProtocol::default(), sessions).await?;
//! server.run().await
//! # }
//! ```
//!
//! Logging goes through [`tracing`]; install a subscriber in the application
//! to see it. Dropped frames, accepted connections and caught duty panics are
//! counted through [`metrics`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

// Transport layer (feature-gated)
#[cfg(feature = "transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "transport")))]
pub mod transport;

// Client API (feature-gated)
#[cfg(feature = "client")]
#[cfg_attr(docsrs, doc(cfg(feature = "client")))]
pub mod client;

// Server API (feature-gated)
#[cfg(feature = "server")]
#[cfg_attr(docsrs, doc(cfg(feature = "server")))]
pub mod server;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{FrameError, NetContext, TransportError, TransportResult};

    #[cfg(feature = "transport")]
    pub use crate::transport::{
        CommProtocol, ConnKind, ConnState, Connection, ConnectionConfig, DispatchErrorPolicy,
        Frame, FrameCodec, HandlerError, NetAction, NetworkCallback, Protocol, SessionManager,
    };

    #[cfg(feature = "client")]
    pub use crate::client::{ClientBuilder, ClientConfig, ServiceClient, TransportClient};

    #[cfg(feature = "server")]
    pub use crate::server::{Server, ServerBuilder, ServerConfig, SessionFactory};
}

// Re-export commonly used items at crate root
pub use crate::core::{FrameError, NetContext, TransportError, TransportResult};

#[cfg(feature = "transport")]
pub use transport::{Connection, Frame, NetAction, NetworkCallback, SessionManager};
