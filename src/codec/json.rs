//! JSON message protocol
//!
//! One newline-terminated JSON document per message:
//! `{"head": "<registered name>", "body": <message>}`.

use super::registry::{downcast, AnyMessage, MessageRegistry};
use super::{close_halves, CloseSignal, Codec, Protocol, Stream};
use crate::error::{NetError, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

type JsonRegistry = MessageRegistry<String, serde_json::Value>;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    head: String,
    body: serde_json::Value,
}

fn encode_json<T: Serialize + Any>(msg: &(dyn Any + Send + Sync)) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(downcast::<T>(msg)?)?)
}

fn decode_json<T: DeserializeOwned + Send + Sync + 'static>(
    value: serde_json::Value,
) -> Result<AnyMessage> {
    Ok(Box::new(serde_json::from_value::<T>(value)?))
}

/// Protocol producing [`JsonCodec`]s over a shared type registry
#[derive(Debug, Clone, Default)]
pub struct JsonProtocol {
    registry: Arc<JsonRegistry>,
}

impl JsonProtocol {
    /// Create a protocol with an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its Rust type name
    pub fn register<T>(&mut self) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register_name::<T>(std::any::type_name::<T>())
    }

    /// Register `T` under an explicit wire name
    pub fn register_name<T>(&mut self, name: impl Into<String>) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let registry = Arc::get_mut(&mut self.registry).ok_or_else(|| {
            NetError::Config("JSON registry is shared; register types before building codecs".to_string())
        })?;
        registry.register::<T>(name.into(), encode_json::<T>, decode_json::<T>)
    }

    /// Wire name registered for `T`
    pub fn name_of<T: Any>(&self) -> Option<&str> {
        self.registry.id_of::<T>().map(String::as_str)
    }
}

impl<S: Stream> Protocol<S> for JsonProtocol {
    type Codec = JsonCodec<S>;

    fn new_codec(&self, stream: S) -> Result<Self::Codec> {
        let (reader, writer) = tokio::io::split(stream);
        Ok(JsonCodec {
            registry: Arc::clone(&self.registry),
            reader: Mutex::new(Some(BufReader::new(reader))),
            writer: Mutex::new(Some(writer)),
            closing: CloseSignal::default(),
        })
    }
}

/// Codec produced by [`JsonProtocol`]
#[derive(Debug)]
pub struct JsonCodec<S> {
    registry: Arc<JsonRegistry>,
    reader: Mutex<Option<BufReader<ReadHalf<S>>>>,
    writer: Mutex<Option<WriteHalf<S>>>,
    closing: CloseSignal,
}

#[async_trait]
impl<S: Stream> Codec for JsonCodec<S> {
    type Message = AnyMessage;

    async fn receive(&self) -> Result<AnyMessage> {
        let line = self.closing.run(self.read_document()).await?;
        let envelope: Envelope = serde_json::from_str(&line)?;
        self.registry.decode(&envelope.head, envelope.body)
    }

    async fn send(&self, msg: AnyMessage) -> Result<()> {
        let (head, body) = self.registry.encode(msg.as_ref())?;
        let mut data = serde_json::to_vec(&Envelope { head, body })?;
        data.push(b'\n');

        self.closing
            .run(async {
                let mut guard = self.writer.lock().await;
                let writer = guard.as_mut().ok_or(NetError::Closed)?;
                writer.write_all(&data).await?;
                writer.flush().await?;
                Ok(())
            })
            .await
    }

    async fn close(&self) -> Result<()> {
        close_halves(&self.closing, &self.reader, &self.writer).await
    }

    fn discard_buffered_input(&self) {
        if let Ok(mut guard) = self.reader.try_lock() {
            if let Some(reader) = guard.as_mut() {
                let n = reader.buffer().len();
                reader.consume(n);
            }
        }
    }
}

impl<S: Stream> JsonCodec<S> {
    /// Next non-blank line
    async fn read_document(&self) -> Result<String> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(NetError::Closed)?;

        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                return Err(NetError::Closed);
            }
            if !line.trim().is_empty() {
                return Ok(line);
            }
        }
    }
}
