//! Error types for a3s-net

use thiserror::Error;

/// Errors that can occur on sessions, codecs and the acceptor
#[derive(Debug, Error)]
pub enum NetError {
    /// Operation attempted on a session that is already closed
    #[error("Session closed")]
    Closed,

    /// Asynchronous send queue was full; the session has been closed
    #[error("Session blocked: send queue is full")]
    Blocked,

    /// Frame body length exceeds the configured maximum
    #[error("Packet too large: {size} bytes (max {max})")]
    PacketTooLarge { size: usize, max: usize },

    /// Packet header could not be read completely
    #[error("Packet head error")]
    PacketHead,

    /// Packet body was shorter than its header announced
    #[error("Packet body length error")]
    PacketBody,

    /// Message type or wire identifier has no registry entry
    #[error("Message not registered: {0}")]
    NotRegistered(String),

    /// Message type or wire identifier registered twice
    #[error("Duplicate registration: {0}")]
    DuplicateRegistration(String),

    /// Underlying stream failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Protobuf decode failure
    #[error("Protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl NetError {
    /// True for the lifecycle errors that only report the session state
    pub fn is_closed(&self) -> bool {
        matches!(self, NetError::Closed | NetError::Blocked)
    }
}

/// Result type alias for network operations
pub type Result<T> = std::result::Result<T, NetError>;
