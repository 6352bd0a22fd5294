//! Transport layer.
//!
//! - **Framing**: [`Frame`], [`FrameHeader`] and the [`FrameCodec`] tokio codec
//! - **Stream codec**: [`Codec`] split into a [`CodecReader`] / [`CodecWriter`] pair,
//!   produced per socket by a [`Protocol`]
//! - **Connections**: [`Connection`] with its receive, transmit and dispatch duties
//! - **Registry**: the sharded [`SessionManager`]
//! - **Contracts**: [`NetworkCallback`] (inbound events) and [`NetAction`] (outbound actions)
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Server  /  TransportClient          │
//! ├─────────────────────────────────────────┤
//! │          SessionManager                 │
//! ├─────────────────────────────────────────┤
//! │   Connection (receive/transmit/dispatch)│
//! ├─────────────────────────────────────────┤
//! │        Codec / FrameCodec               │
//! ├─────────────────────────────────────────┤
//! │              TCP                        │
//! └─────────────────────────────────────────┘
//! ```

mod callback;
mod codec;
mod connection;
mod frame;
mod manager;
mod sync;

pub use callback::{HandlerError, NetAction, NetworkCallback};
pub use codec::{Codec, CodecReader, CodecWriter, CommProtocol, FrameCodec, Protocol};
pub use connection::{
    ConnKind, ConnState, Connection, ConnectionBuilder, ConnectionConfig, DispatchErrorPolicy,
};
pub use frame::{Frame, FrameHeader};
pub use manager::{ManagerConfig, SessionManager};
pub use sync::WaitGroup;
