//! Contracts between the transport and the application.
//!
//! The transport calls into the application through [`NetworkCallback`]; the
//! application calls out through [`NetAction`].

use std::sync::Arc;

use super::connection::Connection;
use super::frame::Frame;
use crate::core::TransportResult;

/// Error type returned by business message handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Business-level event handler, chosen per connection at construction time.
///
/// All methods are invoked from connection duties and must not block for
/// long; long-running work belongs on a spawned task.
pub trait NetworkCallback: Send + Sync + 'static {
    /// Called once per decoded non-heartbeat frame, from a dispatch duty.
    fn on_message(&self, conn: &Arc<Connection>, frame: Frame) -> Result<(), HandlerError>;

    /// Called once, after all of the connection's duties are running.
    fn on_connect(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }

    /// Called exactly once, at the start of close teardown.
    fn on_disconnect(&self, conn: &Arc<Connection>) {
        let _ = conn;
    }
}

/// Outbound actions an application may perform.
pub trait NetAction {
    /// Send `frame` to one connection of `group`, chosen round-robin.
    fn send(&self, group: &str, frame: Frame) -> TransportResult<()>;

    /// Send `frame` to every live connection of `group`.
    fn broadcast(&self, group: &str, frame: Frame) -> TransportResult<()>;

    /// Close `conn` in the background.
    fn close(&self, conn: &Arc<Connection>) {
        conn.shutdown();
    }
}
