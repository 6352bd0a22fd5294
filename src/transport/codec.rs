//! Stream codec for wirepool frames.
//!
//! [`FrameCodec`] is the byte-level [`Decoder`]/[`Encoder`] pair. [`Codec`]
//! binds it to a byte stream and splits into a [`CodecReader`] (owned by the
//! receive duty) and a cloneable [`CodecWriter`] (shared by the transmit duty
//! and the heartbeat echo path).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};
use tracing::trace;

use super::frame::{Frame, FrameHeader};
use crate::core::FrameError;
use crate::core::constants::{FRAME_MAGIC, HEADER_SIZE, MAX_BODY_SIZE};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Byte-level frame codec.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    magic: u32,
    max_body: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec using the default magic and the 8 MiB body ceiling.
    pub fn new() -> Self {
        Self {
            magic: FRAME_MAGIC,
            max_body: MAX_BODY_SIZE,
        }
    }

    /// Override the protocol magic.
    pub fn magic(mut self, magic: u32) -> Self {
        self.magic = magic;
        self
    }

    /// Override the body ceiling.
    pub fn max_body(mut self, max_body: usize) -> Self {
        self.max_body = max_body;
        self
    }

    /// Configured magic.
    pub fn magic_value(&self) -> u32 {
        self.magic
    }

    /// Configured body ceiling.
    pub fn max_body_value(&self) -> usize {
        self.max_body
    }

    fn check_header(&self, header: &FrameHeader) -> Result<usize, FrameError> {
        if header.magic != self.magic {
            return Err(FrameError::BadMagic {
                expected: self.magic,
                actual: header.magic,
            });
        }

        let length = header.length as usize;
        if length > self.max_body {
            return Err(FrameError::OversizedFrame {
                length,
                limit: self.max_body,
            });
        }
        Ok(length)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if src.len() < HEADER_SIZE {
            src.reserve(HEADER_SIZE - src.len());
            return Ok(None);
        }

        let header = FrameHeader::from_bytes(&src[..HEADER_SIZE])?;
        let length = self.check_header(&header)?;

        let total = HEADER_SIZE + length;
        if src.len() < total {
            // The length field is bounded above, so this never over-allocates.
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(length).freeze();
        Ok(Some(Frame::with_magic(header.magic, header.msg_type, body)))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if buf.is_empty() {
            return Ok(None);
        }
        if buf.len() < HEADER_SIZE {
            return Err(FrameError::TruncatedHeader {
                expected: HEADER_SIZE,
                actual: buf.len(),
            });
        }

        let header = FrameHeader::from_bytes(&buf[..HEADER_SIZE])?;
        Err(FrameError::TruncatedBody {
            expected: header.length as usize,
            actual: buf.len() - HEADER_SIZE,
        })
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        frame.encode_into(dst, self.max_body)
    }
}

/// A frame stream bound to one socket, not yet split between duties.
pub struct Codec {
    reader: BoxReader,
    writer: BoxWriter,
    frames: FrameCodec,
    peer_addr: Option<SocketAddr>,
}

impl Codec {
    /// Build a codec from separate read and write halves.
    pub fn new<R, W>(reader: R, writer: W, frames: FrameCodec) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            frames,
            peer_addr: None,
        }
    }

    /// Build a codec over a TCP stream.
    pub fn from_tcp(stream: TcpStream, frames: FrameCodec) -> Self {
        let peer_addr = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        let mut codec = Self::new(reader, writer, frames);
        codec.peer_addr = peer_addr;
        codec
    }

    /// Build a codec over any duplex byte stream.
    pub fn from_io<T>(io: T, frames: FrameCodec) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(io);
        Self::new(reader, writer, frames)
    }

    /// Remote address, when the codec wraps a TCP stream.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Split into the receive side and the shared transmit side.
    pub fn into_parts(self) -> (CodecReader, CodecWriter) {
        let writer = CodecWriter {
            inner: Arc::new(AsyncMutex::new(FramedWrite::new(self.writer, self.frames))),
            magic: self.frames.magic,
        };
        let reader = CodecReader {
            inner: FramedRead::new(self.reader, self.frames),
            writer: writer.clone(),
            echo_heartbeats: true,
        };
        (reader, writer)
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("frames", &self.frames)
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Receive side of a [`Codec`].
pub struct CodecReader {
    inner: FramedRead<BoxReader, FrameCodec>,
    writer: CodecWriter,
    echo_heartbeats: bool,
}

impl CodecReader {
    /// Choose whether received heartbeats are echoed back to the peer.
    pub fn set_echo_heartbeats(&mut self, echo: bool) {
        self.echo_heartbeats = echo;
    }

    /// Decode the next frame.
    ///
    /// Returns `Ok(None)` when a heartbeat was received; the heartbeat has
    /// already been answered on the same stream (if echoing is enabled) and
    /// is never surfaced. A stream that ends on a frame boundary is reported
    /// as a zero-byte [`FrameError::TruncatedHeader`].
    pub async fn decode(&mut self) -> Result<Option<Frame>, FrameError> {
        let frame = match self.inner.next().await {
            Some(frame) => frame?,
            None => {
                return Err(FrameError::TruncatedHeader {
                    expected: HEADER_SIZE,
                    actual: 0,
                });
            }
        };

        if frame.is_heartbeat() {
            trace!(echo = self.echo_heartbeats, "heartbeat received");
            if self.echo_heartbeats {
                self.writer
                    .encode(Frame::heartbeat_with_magic(frame.magic()))
                    .await?;
            }
            return Ok(None);
        }
        Ok(Some(frame))
    }
}

/// Transmit side of a [`Codec`]. Cheap to clone; writes are serialized.
#[derive(Clone)]
pub struct CodecWriter {
    inner: Arc<AsyncMutex<FramedWrite<BoxWriter, FrameCodec>>>,
    magic: u32,
}

impl CodecWriter {
    /// Encode and flush one frame.
    pub async fn encode(&self, frame: Frame) -> Result<(), FrameError> {
        let mut sink = self.inner.lock().await;
        sink.send(frame).await
    }

    /// Send a heartbeat frame.
    pub async fn heartbeat(&self) -> Result<(), FrameError> {
        self.encode(Frame::heartbeat_with_magic(self.magic)).await
    }

    /// Flush and shut down the write half.
    pub async fn close(&self) -> Result<(), FrameError> {
        let mut sink = self.inner.lock().await;
        match sink.close().await {
            Err(FrameError::Io(e)) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Factory turning accepted sockets into codecs.
pub trait Protocol: Send + Sync + 'static {
    /// Wrap an accepted or dialed stream.
    fn new_codec(&self, stream: TcpStream) -> Codec;
}

/// The stock protocol: default frame layout with configurable magic and ceiling.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommProtocol {
    frames: FrameCodec,
}

impl CommProtocol {
    /// Protocol using the given frame codec settings.
    pub fn new(frames: FrameCodec) -> Self {
        Self { frames }
    }
}

impl Protocol for CommProtocol {
    fn new_codec(&self, stream: TcpStream) -> Codec {
        Codec::from_tcp(stream, self.frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;
    use proptest::prelude::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec::new().encode(frame.clone(), &mut buf).unwrap();
        buf
    }

    #[test]
    fn test_decode_waits_for_full_header() {
        let mut codec = FrameCodec::new();
        let full = encoded(&Frame::new(5, &b"abc"[..]));
        let mut buf = BytesMut::from(&full[..6]);

        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn test_decode_waits_for_full_body() {
        let mut codec = FrameCodec::new();
        let full = encoded(&Frame::new(5, &b"abcdef"[..]));
        let mut buf = BytesMut::from(&full[..12]);

        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[12..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.msg_type(), 5);
        assert_eq!(&frame.body()[..], b"abcdef");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_back_to_back() {
        let mut codec = FrameCodec::new();
        let mut buf = encoded(&Frame::new(1, &b"one"[..]));
        buf.extend_from_slice(&encoded(&Frame::new(2, &b"two"[..])));

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().msg_type(), 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().msg_type(), 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_eof_truncated_header() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::from(&[0x13u8, 0x2a, 0xfa, 0xbd][..]);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::TruncatedHeader {
                expected: 10,
                actual: 4
            }
        ));
    }

    #[test]
    fn test_eof_truncated_body() {
        let mut codec = FrameCodec::new();
        let full = encoded(&Frame::new(9, vec![7u8; 20]));
        let mut buf = BytesMut::from(&full[..15]);

        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            FrameError::TruncatedBody {
                expected: 20,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_eof_clean() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_rejected_before_body() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(FRAME_MAGIC);
        buf.put_u16(3);
        buf.put_u32((MAX_BODY_SIZE + 1) as u32);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::OversizedFrame { .. }));
    }

    #[test]
    fn test_max_body_accepted() {
        let mut codec = FrameCodec::new();
        let frame = Frame::new(3, vec![0xAB; MAX_BODY_SIZE]);
        let mut buf = encoded(&frame);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.len(), MAX_BODY_SIZE);
    }

    #[test]
    fn test_custom_ceiling() {
        let mut codec = FrameCodec::new().max_body(4);
        let mut buf = encoded(&Frame::new(3, &b"12345"[..]));

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::OversizedFrame {
                length: 5,
                limit: 4
            })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut codec = FrameCodec::new().magic(0xDEAD_BEEF);
        let mut buf = encoded(&Frame::new(3, &b"x"[..]));

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::BadMagic {
                expected: 0xDEAD_BEEF,
                actual: FRAME_MAGIC
            })
        ));
    }

    #[tokio::test]
    async fn test_reader_echoes_heartbeat() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (mut reader, _writer) = Codec::from_io(local, FrameCodec::new()).into_parts();

        let mut wire = encoded(&Frame::heartbeat());
        wire.extend_from_slice(&encoded(&Frame::new(0x22, &b"hi"[..])));
        remote.write_all(&wire).await.unwrap();

        // Heartbeat is consumed and reported as "no message"
        assert!(reader.decode().await.unwrap().is_none());
        let frame = reader.decode().await.unwrap().unwrap();
        assert_eq!(frame.msg_type(), 0x22);

        // And echoed back verbatim
        let mut echo = [0u8; HEADER_SIZE];
        remote.read_exact(&mut echo).await.unwrap();
        assert_eq!(&echo[..], &encoded(&Frame::heartbeat())[..]);
    }

    #[tokio::test]
    async fn test_reader_silent_heartbeat() {
        let (local, mut remote) = tokio::io::duplex(1024);
        let (mut reader, _writer) = Codec::from_io(local, FrameCodec::new()).into_parts();
        reader.set_echo_heartbeats(false);

        remote.write_all(&encoded(&Frame::heartbeat())).await.unwrap();
        assert!(reader.decode().await.unwrap().is_none());

        // Nothing was written back
        let mut probe = [0u8; 1];
        let read = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            remote.read(&mut probe),
        )
        .await;
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn test_reader_reports_clean_eof() {
        let (local, remote) = tokio::io::duplex(64);
        let (mut reader, _writer) = Codec::from_io(local, FrameCodec::new()).into_parts();
        drop(remote);

        let err = reader.decode().await.unwrap_err();
        assert!(err.is_disconnect());
    }

    #[tokio::test]
    async fn test_writer_round_trip() {
        let (a, b) = tokio::io::duplex(1024);
        let (_ra, writer) = Codec::from_io(a, FrameCodec::new()).into_parts();
        let (mut reader, _wb) = Codec::from_io(b, FrameCodec::new()).into_parts();

        writer.encode(Frame::new(17, &b"payload"[..])).await.unwrap();
        let frame = reader.decode().await.unwrap().unwrap();
        assert_eq!(frame, Frame::new(17, &b"payload"[..]));
    }

    proptest! {
        #[test]
        fn prop_round_trip(msg_type in 1u16.., body in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let frame = Frame::new(msg_type, body);
            let mut buf = encoded(&frame);
            let decoded = FrameCodec::new().decode(&mut buf).unwrap().unwrap();
            prop_assert_eq!(decoded, frame);
            prop_assert!(buf.is_empty());
        }
    }
}
