//! Raw bytes protocol
//!
//! Sends payloads untouched and receives everything up to end of stream.
//! Mostly useful as the inner protocol of [`FramedProtocol`](super::FramedProtocol),
//! where end of stream is the end of the current frame.

use super::{close_halves, CloseSignal, Codec, Protocol, Stream};
use crate::error::{NetError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// Protocol producing [`RawCodec`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct RawProtocol;

impl<S: Stream> Protocol<S> for RawProtocol {
    type Codec = RawCodec<S>;

    fn new_codec(&self, stream: S) -> Result<Self::Codec> {
        let (reader, writer) = tokio::io::split(stream);
        Ok(RawCodec {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closing: CloseSignal::default(),
        })
    }
}

/// Codec passing `Bytes` through unchanged
#[derive(Debug)]
pub struct RawCodec<S> {
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    closing: CloseSignal,
}

#[async_trait]
impl<S: Stream> Codec for RawCodec<S> {
    type Message = Bytes;

    async fn receive(&self) -> Result<Bytes> {
        self.closing
            .run(async {
                let mut guard = self.reader.lock().await;
                let reader = guard.as_mut().ok_or(NetError::Closed)?;
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf).await?;
                Ok(Bytes::from(buf))
            })
            .await
    }

    async fn send(&self, msg: Bytes) -> Result<()> {
        self.closing
            .run(async {
                let mut guard = self.writer.lock().await;
                let writer = guard.as_mut().ok_or(NetError::Closed)?;
                writer.write_all(&msg).await?;
                writer.flush().await?;
                Ok(())
            })
            .await
    }

    async fn close(&self) -> Result<()> {
        close_halves(&self.closing, &self.reader, &self.writer).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_raw_send_then_receive_to_eof() {
        let (client, server) = tokio::io::duplex(64);
        let sender = RawProtocol.new_codec(client).unwrap();
        let receiver = RawProtocol.new_codec(server).unwrap();

        sender.send(Bytes::from_static(b"hello ")).await.unwrap();
        sender.send(Bytes::from_static(b"world")).await.unwrap();
        sender.close().await.unwrap();

        let data = receiver.receive().await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn test_close_aborts_stalled_send_and_receive() {
        // The peer never reads, so the second send blocks on a full pipe
        let (client, _server) = tokio::io::duplex(16);
        let codec = std::sync::Arc::new(RawProtocol.new_codec(client).unwrap());
        let sending = {
            let codec = std::sync::Arc::clone(&codec);
            tokio::spawn(async move { codec.send(Bytes::from(vec![1u8; 100])).await })
        };
        let receiving = {
            let codec = std::sync::Arc::clone(&codec);
            tokio::spawn(async move { codec.receive().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!sending.is_finished());

        tokio::time::timeout(std::time::Duration::from_secs(1), codec.close())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(sending.await.unwrap(), Err(NetError::Closed)));
        assert!(matches!(receiving.await.unwrap(), Err(NetError::Closed)));
    }

    #[tokio::test]
    async fn test_raw_send_after_close_fails() {
        let (client, _server) = tokio::io::duplex(64);
        let codec = RawProtocol.new_codec(client).unwrap();
        codec.close().await.unwrap();
        codec.close().await.unwrap();
        assert!(matches!(
            codec.send(Bytes::from_static(b"x")).await,
            Err(NetError::Closed)
        ));
    }
}
