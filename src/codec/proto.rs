//! Protobuf message protocol with numeric type ids
//!
//! Wire format: `[body length: u16 BE][type id: u16 BE][protobuf body]`.

use super::registry::{downcast, AnyMessage, MessageRegistry};
use super::{close_halves, CloseSignal, Codec, Protocol, Stream};
use crate::error::{NetError, Result};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::any::Any;
use std::io::ErrorKind;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

const HEAD_SIZE: usize = 4;

type ProstRegistry = MessageRegistry<u16, Bytes>;

fn encode_prost<T: prost::Message + Any>(msg: &(dyn Any + Send + Sync)) -> Result<Bytes> {
    Ok(Bytes::from(downcast::<T>(msg)?.encode_to_vec()))
}

fn decode_prost<T: prost::Message + Default + Send + Sync + 'static>(body: Bytes) -> Result<AnyMessage> {
    Ok(Box::new(T::decode(body)?))
}

/// Protocol producing [`ProstCodec`]s over a shared id registry
#[derive(Debug, Clone, Default)]
pub struct ProstProtocol {
    registry: Arc<ProstRegistry>,
}

impl ProstProtocol {
    /// Create a protocol with an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `id`
    pub fn register<T>(&mut self, id: u16) -> Result<()>
    where
        T: prost::Message + Default + Send + Sync + 'static,
    {
        let registry = Arc::get_mut(&mut self.registry).ok_or_else(|| {
            NetError::Config("Protobuf registry is shared; register types before building codecs".to_string())
        })?;
        registry.register::<T>(id, encode_prost::<T>, decode_prost::<T>)
    }

    /// Id registered for `T`
    pub fn id_of<T: Any>(&self) -> Option<u16> {
        self.registry.id_of::<T>().copied()
    }
}

impl<S: Stream> Protocol<S> for ProstProtocol {
    type Codec = ProstCodec<S>;

    fn new_codec(&self, stream: S) -> Result<Self::Codec> {
        let (reader, writer) = tokio::io::split(stream);
        Ok(ProstCodec {
            registry: Arc::clone(&self.registry),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closing: CloseSignal::default(),
        })
    }
}

/// Codec produced by [`ProstProtocol`]
#[derive(Debug)]
pub struct ProstCodec<S> {
    registry: Arc<ProstRegistry>,
    reader: Mutex<Option<ReadHalf<S>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    closing: CloseSignal,
}

#[async_trait]
impl<S: Stream> Codec for ProstCodec<S> {
    type Message = AnyMessage;

    async fn receive(&self) -> Result<AnyMessage> {
        let (id, body) = self.closing.run(self.read_packet()).await?;
        self.registry.decode(&id, body)
    }

    async fn send(&self, msg: AnyMessage) -> Result<()> {
        let (id, body) = self.registry.encode(msg.as_ref())?;
        let size = u16::try_from(body.len()).map_err(|_| NetError::PacketTooLarge {
            size: body.len(),
            max: u16::MAX as usize,
        })?;

        let mut packet = BytesMut::with_capacity(HEAD_SIZE + body.len());
        packet.put_u16(size);
        packet.put_u16(id);
        packet.put_slice(&body);

        self.closing
            .run(async {
                let mut guard = self.writer.lock().await;
                let writer = guard.as_mut().ok_or(NetError::Closed)?;
                writer.write_all(&packet).await?;
                writer.flush().await?;
                Ok(())
            })
            .await
    }

    async fn close(&self) -> Result<()> {
        close_halves(&self.closing, &self.reader, &self.writer).await
    }
}

impl<S: Stream> ProstCodec<S> {
    async fn read_packet(&self) -> Result<(u16, Bytes)> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(NetError::Closed)?;

        let mut head = [0u8; HEAD_SIZE];
        reader.read_exact(&mut head).await.map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => NetError::PacketHead,
            _ => NetError::Io(e),
        })?;
        let size = u16::from_be_bytes([head[0], head[1]]) as usize;
        let id = u16::from_be_bytes([head[2], head[3]]);

        let mut body = BytesMut::zeroed(size);
        reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => NetError::PacketBody,
            _ => NetError::Io(e),
        })?;

        Ok((id, body.freeze()))
    }
}
