//! Error types for wirepool.

use std::io;

use thiserror::Error;

/// Errors produced while framing or unframing bytes.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The stream ended before a full header was read.
    #[error("truncated header: got {actual} of {expected} bytes")]
    TruncatedHeader {
        /// Header size.
        expected: usize,
        /// Bytes available when the stream ended.
        actual: usize,
    },

    /// The stream ended before the announced body was read.
    #[error("truncated body: got {actual} of {expected} bytes")]
    TruncatedBody {
        /// Announced body length.
        expected: usize,
        /// Bytes available when the stream ended.
        actual: usize,
    },

    /// The length field exceeds the configured ceiling.
    #[error("oversized frame: {length} bytes exceeds limit of {limit}")]
    OversizedFrame {
        /// Announced (or requested) body length.
        length: usize,
        /// Maximum accepted body length.
        limit: usize,
    },

    /// The header does not start with the protocol magic.
    #[error("bad magic: expected {expected:#010x}, got {actual:#010x}")]
    BadMagic {
        /// Configured magic.
        expected: u32,
        /// Magic found on the wire.
        actual: u32,
    },

    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Whether the peer simply went away (clean or mid-frame EOF).
    pub fn is_disconnect(&self) -> bool {
        match self {
            FrameError::TruncatedHeader { actual: 0, .. } => true,
            FrameError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Errors surfaced by connections, session managers, servers and clients.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Framing error.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// I/O error (socket operations).
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Failed to bind a listening socket.
    #[error("bind failed on {address}: {source}")]
    Bind {
        /// Requested bind address.
        address: String,
        /// Underlying error.
        #[source]
        source: io::Error,
    },

    /// No group is registered under this name.
    #[error("no target group: {0}")]
    NoTargetGroup(String),

    /// No session is registered under this identifier.
    #[error("no such session: {0}")]
    NoSuchSession(u64),

    /// The group exists but holds no live connection.
    #[error("no connection available in group {0}")]
    NoConnectionAvailable(String),

    /// Group resolution failed during registration.
    #[error("unknown group: {0}")]
    UnknownGroup(String),

    /// The outbound queue was full and the frame was dropped.
    #[error("outbound queue full on connection {0}")]
    QueueFull(u64),

    /// The connection is closed.
    #[error("connection {0} closed")]
    ConnectionClosed(u64),

    /// The manager or client has been disposed.
    #[error("transport closed")]
    TransportClosed,

    /// `start` was called more than once.
    #[error("connection {0} already started")]
    AlreadyStarted(u64),

    /// Dialing the peer did not complete in time.
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
}

impl TransportError {
    /// Check if this error is a name or identifier resolution failure.
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            TransportError::NoTargetGroup(_)
                | TransportError::NoSuchSession(_)
                | TransportError::NoConnectionAvailable(_)
                | TransportError::UnknownGroup(_)
        )
    }

    /// Check if this error means the target can no longer be used.
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            TransportError::ConnectionClosed(_) | TransportError::TransportClosed
        )
    }
}

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
