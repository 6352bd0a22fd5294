//! Protocol and runtime constants.
//!
//! Wire-level values are fixed by the frame format and MUST NOT be changed
//! without changing every peer. Runtime defaults can be overridden through the
//! configuration types.

use std::time::Duration;

// =============================================================================
// FRAME LAYOUT
// =============================================================================

/// Magic number opening every frame.
pub const FRAME_MAGIC: u32 = 0x132A_FABD;

/// Size of the magic field.
pub const MAGIC_SIZE: usize = 4;

/// Size of the message type field.
pub const TYPE_SIZE: usize = 2;

/// Size of the body length field.
pub const LENGTH_SIZE: usize = 4;

/// Full header size (magic + type + length).
pub const HEADER_SIZE: usize = MAGIC_SIZE + TYPE_SIZE + LENGTH_SIZE;

/// Largest body a frame may carry (8 MiB).
pub const MAX_BODY_SIZE: usize = 1 << 23;

/// Message type reserved for heartbeats. Heartbeats carry no body.
pub const HEARTBEAT_TYPE: u16 = 0;

// =============================================================================
// CONNECTION DEFAULTS
// =============================================================================

/// Outbound/inbound queue capacity for server-accepted connections.
pub const DEFAULT_SERVER_QUEUE_SIZE: usize = 128;

/// Outbound/inbound queue capacity for client-initiated connections.
pub const DEFAULT_CLIENT_QUEUE_SIZE: usize = 1024;

/// Dispatch duties for server-accepted connections (keeps per-peer ordering).
pub const DEFAULT_SERVER_DISPATCHERS: usize = 1;

/// Dispatch duties for client-initiated connections.
pub const DEFAULT_CLIENT_DISPATCHERS: usize = 16;

/// Interval between heartbeats emitted by client connections.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Idle read deadline for server-accepted connections.
pub const IDLE_READ_TIMEOUT: Duration = Duration::from_secs(4 * 60);

/// Upper bound on flushing buffered output while a connection tears down.
pub const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// SESSION MANAGER
// =============================================================================

/// Number of independently locked shards in a session manager.
pub const DEFAULT_SHARD_COUNT: usize = 8;

// =============================================================================
// CLIENT
// =============================================================================

/// Timeout for establishing an outbound TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before a failed or dropped outbound connection is redialed.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
