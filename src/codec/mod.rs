//! Protocol and codec contract between the session engine and
//! message formats
//!
//! A [`Protocol`] turns a duplex byte stream into a [`Codec`]; a codec
//! encodes, writes, reads and decodes one message at a time. The session
//! layer serializes access, so implementations only need to keep their read
//! side and write side independently usable.

use crate::error::{NetError, Result};
use crate::session::wait_true;
use async_trait::async_trait;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

pub mod framed;
pub mod json;
pub mod proto;
pub mod raw;
pub mod registry;

pub use framed::{FrameIo, FramedCodec, FramedProtocol};
pub use json::{JsonCodec, JsonProtocol};
pub use proto::{ProstCodec, ProstProtocol};
pub use raw::{RawCodec, RawProtocol};
pub use registry::{AnyMessage, MessageRegistry};

/// Any duplex byte stream a codec can be built over
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Stream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Encode/decode plus I/O for one connection
#[async_trait]
pub trait Codec: Send + Sync + 'static {
    /// Message value produced by `receive` and accepted by `send`
    type Message: Send + 'static;

    /// Read and decode the next message
    async fn receive(&self) -> Result<Self::Message>;

    /// Encode and write one message
    async fn send(&self, msg: Self::Message) -> Result<()>;

    /// Release the underlying stream. Safe to call after the peer has
    /// already gone away, and more than once. Must not wait for an in-flight
    /// `send` or `receive`; those fail with [`NetError::Closed`] instead.
    async fn close(&self) -> Result<()>;

    /// Receives messages that were queued for asynchronous sending but never
    /// written. Default implementation drops them.
    fn clear_send_queue(&self, _pending: Vec<Self::Message>) {}

    /// Drop input read ahead past the last decoded message. Framing layers
    /// call this at every frame boundary. Default implementation does nothing.
    fn discard_buffered_input(&self) {}
}

/// Factory producing a codec for a stream
pub trait Protocol<S>: Send + Sync {
    type Codec: Codec;

    /// Build a codec bound to `stream`
    fn new_codec(&self, stream: S) -> Result<Self::Codec>;
}

/// Close flag shared by a codec's read and write paths.
///
/// I/O runs through [`CloseSignal::run`], so `close()` never waits for a
/// stalled read or write: triggering the signal aborts them with
/// [`NetError::Closed`] and releases their locks.
#[derive(Debug)]
pub(crate) struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self {
            tx: watch::channel(false).0,
        }
    }
}

impl CloseSignal {
    pub(crate) fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Run `io` unless the signal fires first
    pub(crate) async fn run<T, F>(&self, io: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut rx = self.tx.subscribe();
        tokio::select! {
            biased;
            _ = wait_true(&mut rx) => Err(NetError::Closed),
            result = io => result,
        }
    }
}

/// Trigger `signal`, drop the read half and shut down the write half.
/// A peer that already disconnected is not an error.
pub(crate) async fn close_halves<R, W>(
    signal: &CloseSignal,
    reader: &Mutex<Option<R>>,
    writer: &Mutex<Option<W>>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    signal.trigger();
    reader.lock().await.take();
    let Some(mut writer) = writer.lock().await.take() else {
        return Ok(());
    };
    match writer.shutdown().await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
        Err(e) => Err(e.into()),
    }
}
