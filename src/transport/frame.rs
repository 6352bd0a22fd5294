//! Frame layout and serialization.
//!
//! Wire format (big-endian):
//! ```text
//! +----------------+-----------+----------------+------------------+
//! | Magic          | Type      | Body length    | Body             |
//! | 4 bytes (BE32) | 2 (BE16)  | 4 bytes (BE32) | `length` bytes   |
//! +----------------+-----------+----------------+------------------+
//! ```
//!
//! Type `0` is the heartbeat and never carries a body.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::core::FrameError;
use crate::core::constants::{FRAME_MAGIC, HEADER_SIZE, HEARTBEAT_TYPE, MAX_BODY_SIZE};

/// Fixed-size frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic.
    pub magic: u32,
    /// Message type tag. Opaque to the transport except for `0`.
    pub msg_type: u16,
    /// Body length in bytes.
    pub length: u32,
}

impl FrameHeader {
    /// Serialize the header (10 bytes).
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..6].copy_from_slice(&self.msg_type.to_be_bytes());
        buf[6..10].copy_from_slice(&self.length.to_be_bytes());
        buf
    }

    /// Parse a header from the first [`HEADER_SIZE`] bytes of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::TruncatedHeader {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        Ok(Self {
            magic: u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
            msg_type: u16::from_be_bytes([bytes[4], bytes[5]]),
            length: u32::from_be_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        })
    }

    /// Whether this header announces a heartbeat.
    pub fn is_heartbeat(&self) -> bool {
        self.msg_type == HEARTBEAT_TYPE
    }
}

/// One complete wire message.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    magic: u32,
    msg_type: u16,
    body: Bytes,
}

impl Frame {
    /// Create a frame carrying `body` under the default magic.
    pub fn new(msg_type: u16, body: impl Into<Bytes>) -> Self {
        Self::with_magic(FRAME_MAGIC, msg_type, body)
    }

    /// Create a frame under a custom magic.
    pub fn with_magic(magic: u32, msg_type: u16, body: impl Into<Bytes>) -> Self {
        Self {
            magic,
            msg_type,
            body: body.into(),
        }
    }

    /// Create a heartbeat frame.
    pub fn heartbeat() -> Self {
        Self::heartbeat_with_magic(FRAME_MAGIC)
    }

    /// Create a heartbeat frame under a custom magic.
    pub fn heartbeat_with_magic(magic: u32) -> Self {
        Self::with_magic(magic, HEARTBEAT_TYPE, Bytes::new())
    }

    /// Protocol magic.
    pub fn magic(&self) -> u32 {
        self.magic
    }

    /// Message type.
    pub fn msg_type(&self) -> u16 {
        self.msg_type
    }

    /// Body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Consume the frame and return its body.
    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Whether this is a heartbeat.
    pub fn is_heartbeat(&self) -> bool {
        self.msg_type == HEARTBEAT_TYPE
    }

    /// Header describing this frame.
    ///
    /// The length saturates at `u32::MAX`; [`Frame::encode_into`] rejects
    /// such bodies before they reach the wire.
    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            magic: self.magic,
            msg_type: self.msg_type,
            length: u32::try_from(self.body.len()).unwrap_or(u32::MAX),
        }
    }

    /// Size of the encoded frame.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// Append the encoded frame to `dst`, enforcing `max_body`.
    pub fn encode_into(&self, dst: &mut BytesMut, max_body: usize) -> Result<(), FrameError> {
        if self.body.len() > max_body {
            return Err(FrameError::OversizedFrame {
                length: self.body.len(),
                limit: max_body,
            });
        }

        dst.reserve(self.encoded_len());
        dst.put_slice(&self.header().to_bytes());
        dst.put_slice(&self.body);
        Ok(())
    }

    /// Encode into a freshly allocated buffer sized `10 + body length`.
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf, MAX_BODY_SIZE)?;
        Ok(buf.freeze())
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("magic", &format_args!("{:#010x}", self.magic))
            .field("msg_type", &self.msg_type)
            .field("len", &self.body.len())
            .finish()
    }
}
