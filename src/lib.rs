//! # a3s-net
//!
//! Transport-agnostic session engine for custom network servers and clients.
//!
//! ## Overview
//!
//! `a3s-net` turns a raw duplex byte stream into a managed message endpoint.
//! Message formats plug in through the [`Protocol`]/[`Codec`] contract; the
//! engine adds lifecycle tracking, backpressure and graceful shutdown on top.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_net::{listen, FrameIo, FramedCodec, FramedProtocol, FramingConfig, JsonCodec};
//! use a3s_net::{JsonProtocol, ServerConfig, Session};
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use tokio::net::TcpStream;
//!
//! type ChatCodec = FramedCodec<TcpStream, JsonCodec<FrameIo>>;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Chat {
//!     text: String,
//! }
//!
//! async fn echo(session: Arc<Session<ChatCodec>>) {
//!     while let Ok(msg) = session.receive().await {
//!         if session.send(msg).await.is_err() {
//!             break;
//!         }
//!     }
//! }
//!
//! # async fn example() -> a3s_net::Result<()> {
//! let mut json = JsonProtocol::new();
//! json.register_name::<Chat>("chat")?;
//! let protocol = FramedProtocol::from_config(json, &FramingConfig::default())?;
//!
//! let server = listen("127.0.0.1:9000", protocol, ServerConfig::default(), echo).await?;
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Protocols
//!
//! - **framed** — length-prefixed frames around any inner protocol
//! - **json** — newline-delimited JSON envelopes over a type registry
//! - **proto** — protobuf bodies tagged with a numeric type id
//! - **raw** — plain bytes, the natural inner protocol for framing
//!
//! ## Architecture
//!
//! - **Session** — one codec plus close-once state, optional send queue and
//!   ordered close callbacks
//! - **Manager** — sharded registry of sessions with a shutdown barrier
//! - **SessionGroup** — keyed sessions that drop out when they close
//! - **Server** — TCP accept loop feeding sessions to a [`Handler`]

pub mod codec;
pub mod config;
pub mod error;
pub mod group;
pub mod manager;
pub mod server;
pub mod session;

// Re-export core types
pub use codec::{
    AnyMessage, Codec, FrameIo, FramedCodec, FramedProtocol, JsonCodec, JsonProtocol,
    MessageRegistry, Protocol, ProstCodec, ProstProtocol, RawCodec, RawProtocol, Stream,
};
pub use config::{ByteOrder, FramingConfig, HeaderWidth, ManagerConfig, ServerConfig};
pub use error::{NetError, Result};
pub use group::SessionGroup;
pub use manager::Manager;
pub use server::{dial, dial_timeout, listen, Handler, Server};
pub use session::{CallbackKey, EngineContext, OwnerId, Session, CLOSE_LINGER};
