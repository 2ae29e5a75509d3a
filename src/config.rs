//! Configuration for the manager, the acceptor and the framing codec
//!
//! All structs deserialize with serde and fall back to sensible defaults
//! for missing fields, so partial JSON/TOML documents are accepted.

use crate::error::{NetError, Result};
use serde::{Deserialize, Serialize};

/// Session manager settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Number of independently locked shards (default: 32)
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,
}

fn default_shard_count() -> usize {
    32
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
        }
    }
}

/// Acceptor settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Capacity of each session's asynchronous send queue.
    /// `0` means sends are written synchronously by the caller.
    #[serde(default)]
    pub send_queue_capacity: usize,

    /// Manager settings for accepted sessions
    #[serde(default)]
    pub manager: ManagerConfig,
}

/// Width of the length header in front of each frame
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HeaderWidth {
    One,
    Two,
    Four,
    /// Accepted for compatibility; lengths are still encoded in the
    /// leading 32 bits and capped to the `u32` range.
    Eight,
}

impl HeaderWidth {
    /// Number of header bytes on the wire
    pub fn size(self) -> usize {
        match self {
            HeaderWidth::One => 1,
            HeaderWidth::Two => 2,
            HeaderWidth::Four => 4,
            HeaderWidth::Eight => 8,
        }
    }

    /// Largest body length the header can carry
    pub fn max_body(self) -> u64 {
        match self {
            HeaderWidth::One => u8::MAX as u64,
            HeaderWidth::Two => u16::MAX as u64,
            HeaderWidth::Four | HeaderWidth::Eight => u32::MAX as u64,
        }
    }
}

impl TryFrom<usize> for HeaderWidth {
    type Error = NetError;

    fn try_from(value: usize) -> Result<Self> {
        match value {
            1 => Ok(HeaderWidth::One),
            2 => Ok(HeaderWidth::Two),
            4 => Ok(HeaderWidth::Four),
            8 => Ok(HeaderWidth::Eight),
            n => Err(NetError::Config(format!(
                "Unsupported header width: {} (expected 1, 2, 4 or 8)",
                n
            ))),
        }
    }
}

/// Byte order of the length header
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ByteOrder {
    #[default]
    BigEndian,
    LittleEndian,
}

/// Length-prefixed framing settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FramingConfig {
    /// Header width (default: four bytes)
    #[serde(default = "default_header_width")]
    pub header_width: HeaderWidth,

    /// Header byte order (default: big-endian)
    #[serde(default)]
    pub byte_order: ByteOrder,

    /// Largest accepted incoming body (default: 64 KiB)
    #[serde(default = "default_max_packet")]
    pub max_recv: u64,

    /// Largest allowed outgoing body (default: 64 KiB)
    #[serde(default = "default_max_packet")]
    pub max_send: u64,
}

fn default_header_width() -> HeaderWidth {
    HeaderWidth::Four
}

fn default_max_packet() -> u64 {
    64 * 1024
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            header_width: default_header_width(),
            byte_order: ByteOrder::default(),
            max_recv: default_max_packet(),
            max_send: default_max_packet(),
        }
    }
}

impl FramingConfig {
    /// Reject settings that could never carry a message
    pub fn validate(&self) -> Result<()> {
        if self.max_recv == 0 || self.max_send == 0 {
            return Err(NetError::Config(format!(
                "Frame size limits must be positive (max_recv={}, max_send={})",
                self.max_recv, self.max_send
            )));
        }
        Ok(())
    }
}
