//! Length-prefixed framing over any inner protocol
//!
//! Wire format: `[header: 1|2|4|8 bytes, body length][body: length bytes]`.
//!
//! The inner protocol's codec is built once over a [`FrameIo`] buffer. On
//! send it encodes into the buffer behind a placeholder header, the header is
//! patched with the body length and the whole frame goes out in one write. On
//! receive exactly one frame body is exposed to the inner codec, which sees
//! end of stream at the frame boundary.

use super::{close_halves, CloseSignal, Codec, Protocol, Stream};
use crate::config::{ByteOrder, FramingConfig, HeaderWidth};
use crate::error::{NetError, Result};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

const BODY_BUF_SLACK: usize = 128;

// ---------------------------------------------------------------------------
// FrameIo
// ---------------------------------------------------------------------------

/// In-memory stream the inner codec of a framed connection is bound to.
///
/// Reads drain the body of the frame currently being decoded and report end
/// of stream once it is exhausted. Writes append to the outgoing frame.
#[derive(Debug, Clone, Default)]
pub struct FrameIo {
    inner: Arc<FrameBuffers>,
}

#[derive(Debug, Default)]
struct FrameBuffers {
    recv: StdMutex<Bytes>,
    send: StdMutex<BytesMut>,
}

fn lock<T>(mutex: &StdMutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::other("frame buffer lock poisoned"))
}

impl FrameIo {
    fn set_recv(&self, body: Bytes) -> io::Result<()> {
        *lock(&self.inner.recv)? = body;
        Ok(())
    }

    fn send_buf(&self) -> io::Result<MutexGuard<'_, BytesMut>> {
        lock(&self.inner.send)
    }
}

impl AsyncRead for FrameIo {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut recv = lock(&self.inner.recv)?;
        let n = recv.len().min(buf.remaining());
        buf.put_slice(&recv[..n]);
        recv.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for FrameIo {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        lock(&self.inner.send)?.extend_from_slice(data);
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Header {
    width: HeaderWidth,
    order: ByteOrder,
}

impl Header {
    fn decode(&self, src: &[u8]) -> u64 {
        match (self.width, self.order) {
            (HeaderWidth::One, _) => src[0] as u64,
            (HeaderWidth::Two, ByteOrder::BigEndian) => u16::from_be_bytes([src[0], src[1]]) as u64,
            (HeaderWidth::Two, ByteOrder::LittleEndian) => {
                u16::from_le_bytes([src[0], src[1]]) as u64
            }
            // Eight-byte headers only carry a 32-bit length in their first four bytes
            (HeaderWidth::Four | HeaderWidth::Eight, ByteOrder::BigEndian) => {
                u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as u64
            }
            (HeaderWidth::Four | HeaderWidth::Eight, ByteOrder::LittleEndian) => {
                u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as u64
            }
        }
    }

    /// `len` must already be within `width.max_body()`
    fn encode(&self, dst: &mut [u8], len: u64) {
        match (self.width, self.order) {
            (HeaderWidth::One, _) => dst[0] = len as u8,
            (HeaderWidth::Two, ByteOrder::BigEndian) => {
                dst[..2].copy_from_slice(&(len as u16).to_be_bytes())
            }
            (HeaderWidth::Two, ByteOrder::LittleEndian) => {
                dst[..2].copy_from_slice(&(len as u16).to_le_bytes())
            }
            (HeaderWidth::Four | HeaderWidth::Eight, ByteOrder::BigEndian) => {
                dst[..4].copy_from_slice(&(len as u32).to_be_bytes())
            }
            (HeaderWidth::Four | HeaderWidth::Eight, ByteOrder::LittleEndian) => {
                dst[..4].copy_from_slice(&(len as u32).to_le_bytes())
            }
        }
    }
}

fn to_usize(n: u64) -> usize {
    usize::try_from(n).unwrap_or(usize::MAX)
}

// ---------------------------------------------------------------------------
// FramedProtocol
// ---------------------------------------------------------------------------

/// Protocol wrapping `base` with a fixed-width length header
#[derive(Debug, Clone)]
pub struct FramedProtocol<P> {
    base: P,
    header: Header,
    max_recv: usize,
    max_send: usize,
}

impl<P> FramedProtocol<P> {
    /// Both limits are clamped to what `width` can represent.
    pub fn new(base: P, width: HeaderWidth, order: ByteOrder, max_recv: u64, max_send: u64) -> Self {
        let cap = width.max_body();
        Self {
            base,
            header: Header { width, order },
            max_recv: to_usize(max_recv.min(cap)),
            max_send: to_usize(max_send.min(cap)),
        }
    }

    /// Build from a validated [`FramingConfig`]
    pub fn from_config(base: P, config: &FramingConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            base,
            config.header_width,
            config.byte_order,
            config.max_recv,
            config.max_send,
        ))
    }

    /// Effective receive limit after clamping
    pub fn max_recv(&self) -> usize {
        self.max_recv
    }

    /// Effective send limit after clamping
    pub fn max_send(&self) -> usize {
        self.max_send
    }
}

impl<S, P> Protocol<S> for FramedProtocol<P>
where
    S: Stream,
    P: Protocol<FrameIo>,
{
    type Codec = FramedCodec<S, P::Codec>;

    fn new_codec(&self, stream: S) -> Result<Self::Codec> {
        let io = FrameIo::default();
        let base = self.base.new_codec(io.clone())?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(FramedCodec {
            base,
            io,
            header: self.header,
            max_recv: self.max_recv,
            max_send: self.max_send,
            reader: Mutex::new(Some(FrameReader {
                stream: reader,
                head: [0; 8],
                body: BytesMut::new(),
            })),
            writer: Mutex::new(Some(writer)),
            closing: CloseSignal::default(),
        })
    }
}

// ---------------------------------------------------------------------------
// FramedCodec
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FrameReader<S> {
    stream: ReadHalf<S>,
    head: [u8; 8],
    body: BytesMut,
}

/// Codec produced by [`FramedProtocol`]
#[derive(Debug)]
pub struct FramedCodec<S, C> {
    base: C,
    io: FrameIo,
    header: Header,
    max_recv: usize,
    max_send: usize,
    reader: Mutex<Option<FrameReader<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    closing: CloseSignal,
}

impl<S, C> FramedCodec<S, C> {
    fn header_len(&self) -> usize {
        self.header.width.size()
    }
}

impl<S, C> FramedCodec<S, C>
where
    S: Stream,
    C: Codec,
{
    async fn receive_frame(&self) -> Result<C::Message> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(NetError::Closed)?;

        let head = &mut reader.head[..self.header_len()];
        reader.stream.read_exact(head).await?;
        let size = to_usize(self.header.decode(head));
        if size > self.max_recv {
            return Err(NetError::PacketTooLarge {
                size,
                max: self.max_recv,
            });
        }

        if reader.body.capacity() < size {
            reader.body.reserve(size + BODY_BUF_SLACK);
        }
        reader.body.resize(size, 0);
        reader.stream.read_exact(&mut reader.body[..]).await?;
        self.io.set_recv(reader.body.split().freeze())?;

        // The reader lock stays held so the frame buffer is ours until decoded
        let result = self.base.receive().await;
        self.base.discard_buffered_input();
        result
    }

    async fn send_frame(&self, msg: C::Message) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(NetError::Closed)?;
        let header_len = self.header_len();

        {
            let mut buf = self.io.send_buf()?;
            buf.clear();
            buf.resize(header_len, 0);
        }

        self.base.send(msg).await?;

        let mut frame = std::mem::take(&mut *self.io.send_buf()?);
        let size = frame.len() - header_len;
        if size > self.max_send {
            frame.clear();
            *self.io.send_buf()? = frame;
            return Err(NetError::PacketTooLarge {
                size,
                max: self.max_send,
            });
        }
        self.header.encode(&mut frame[..header_len], size as u64);

        let result = writer.write_all(&frame).await;
        frame.clear();
        *self.io.send_buf()? = frame;
        result?;
        writer.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<S, C> Codec for FramedCodec<S, C>
where
    S: Stream,
    C: Codec,
{
    type Message = C::Message;

    async fn receive(&self) -> Result<C::Message> {
        self.closing.run(self.receive_frame()).await
    }

    async fn send(&self, msg: C::Message) -> Result<()> {
        self.closing.run(self.send_frame(msg)).await
    }

    async fn close(&self) -> Result<()> {
        close_halves(&self.closing, &self.reader, &self.writer).await
    }

    fn clear_send_queue(&self, pending: Vec<C::Message>) {
        self.base.clear_send_queue(pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawProtocol;
    use tokio_test::io::Builder;

    fn framed(width: HeaderWidth, order: ByteOrder, max: u64) -> FramedProtocol<RawProtocol> {
        FramedProtocol::new(RawProtocol, width, order, max, max)
    }

    #[tokio::test]
    async fn test_two_byte_big_endian_frame_on_the_wire() {
        let payload = b"0123456789";
        let mut frame = vec![0x00, 0x0A];
        frame.extend_from_slice(payload);

        let mock = Builder::new().write(&frame).build();
        let codec = framed(HeaderWidth::Two, ByteOrder::BigEndian, 1024)
            .new_codec(mock)
            .unwrap();
        codec.send(Bytes::from_static(payload)).await.unwrap();

        let mock = Builder::new().read(&frame).build();
        let codec = framed(HeaderWidth::Two, ByteOrder::BigEndian, 1024)
            .new_codec(mock)
            .unwrap();
        let received = codec.receive().await.unwrap();
        assert_eq!(&received[..], payload);
    }

    #[tokio::test]
    async fn test_little_endian_and_eight_byte_headers() {
        let mock = Builder::new().write(&[0x03, 0x00, 0x00, 0x00, b'a', b'b', b'c']).build();
        let codec = framed(HeaderWidth::Four, ByteOrder::LittleEndian, 1024)
            .new_codec(mock)
            .unwrap();
        codec.send(Bytes::from_static(b"abc")).await.unwrap();

        // The length lives in the first four bytes; the rest stay zero
        let mock = Builder::new()
            .write(&[0, 0, 0, 2, 0, 0, 0, 0, b'h', b'i'])
            .build();
        let codec = framed(HeaderWidth::Eight, ByteOrder::BigEndian, 1024)
            .new_codec(mock)
            .unwrap();
        codec.send(Bytes::from_static(b"hi")).await.unwrap();

        let mock = Builder::new().read(&[0, 0, 0, 2, 0, 0, 0, 0, b'h', b'i']).build();
        let codec = framed(HeaderWidth::Eight, ByteOrder::BigEndian, 1024)
            .new_codec(mock)
            .unwrap();
        assert_eq!(&codec.receive().await.unwrap()[..], b"hi");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_after_header_only() {
        // Only the header is scripted; reading any body byte would fail the mock
        let mock = Builder::new().read(&[0x04, 0x01]).build();
        let codec = framed(HeaderWidth::Two, ByteOrder::BigEndian, 1024)
            .new_codec(mock)
            .unwrap();
        match codec.receive().await {
            Err(NetError::PacketTooLarge { size, max }) => {
                assert_eq!(size, 1025);
                assert_eq!(max, 1024);
            }
            other => panic!("expected PacketTooLarge, got {:?}", other.map(|b| b.len())),
        }
    }

    #[tokio::test]
    async fn test_oversized_send_rejected_without_write() {
        let mock = Builder::new().build();
        let codec = framed(HeaderWidth::Two, ByteOrder::BigEndian, 4)
            .new_codec(mock)
            .unwrap();
        let result = codec.send(Bytes::from_static(b"too long")).await;
        assert!(matches!(result, Err(NetError::PacketTooLarge { size: 8, max: 4 })));
    }

    #[tokio::test]
    async fn test_short_header_is_error() {
        let mock = Builder::new().read(&[0x00]).build();
        let codec = framed(HeaderWidth::Two, ByteOrder::BigEndian, 1024)
            .new_codec(mock)
            .unwrap();
        assert!(matches!(codec.receive().await, Err(NetError::Io(_))));
    }

    #[test]
    fn test_limits_clamped_to_header_range() {
        let protocol = framed(HeaderWidth::One, ByteOrder::BigEndian, 10_000);
        assert_eq!(protocol.max_recv(), 255);
        assert_eq!(protocol.max_send(), 255);

        let protocol = framed(HeaderWidth::Eight, ByteOrder::BigEndian, u64::MAX);
        assert_eq!(protocol.max_recv() as u64, (u32::MAX as u64).min(usize::MAX as u64));
    }

    #[tokio::test]
    async fn test_frames_back_to_back_over_duplex() {
        let (client, server) = tokio::io::duplex(1024);
        let protocol = framed(HeaderWidth::Four, ByteOrder::BigEndian, 1024);
        let sender = protocol.new_codec(client).unwrap();
        let receiver = protocol.new_codec(server).unwrap();

        let big = Bytes::from(vec![7u8; 600]);
        sender.send(Bytes::from_static(b"first")).await.unwrap();
        sender.send(Bytes::new()).await.unwrap();
        sender.send(big.clone()).await.unwrap();
        sender.send(Bytes::from_static(b"last")).await.unwrap();

        assert_eq!(&receiver.receive().await.unwrap()[..], b"first");
        assert!(receiver.receive().await.unwrap().is_empty());
        assert_eq!(receiver.receive().await.unwrap(), big);
        assert_eq!(&receiver.receive().await.unwrap()[..], b"last");
    }
}
