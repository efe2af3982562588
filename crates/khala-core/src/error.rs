//! Error types for the khala protocol layer

use thiserror::Error;

/// Result type alias for protocol operations
pub type Result<T> = std::result::Result<T, Error>;

/// Protocol and codec error types
#[derive(Error, Debug)]
pub enum Error {
    /// Reserved or unknown control packet type nibble
    #[error("invalid packet type: 0x{0:02x}")]
    InvalidPacketType(u8),

    /// Fixed-header flags not valid for the packet type
    #[error("invalid fixed-header flags 0b{flags:04b} for {packet}")]
    InvalidFlags { packet: &'static str, flags: u8 },

    /// Remaining-length field is malformed (more than 4 continuation bytes)
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    /// Declared packet length exceeds the accepted maximum
    #[error("packet of {0} bytes exceeds maximum size")]
    PacketTooLarge(usize),

    /// Packet body ended before all declared fields were read
    #[error("truncated {0} packet")]
    Truncated(&'static str),

    /// A length-prefixed string field is not valid UTF-8
    #[error("invalid UTF-8 in {0}")]
    InvalidString(&'static str),

    /// CONNECT carried a protocol name other than "MQTT"
    #[error("invalid protocol name {0:?}")]
    InvalidProtocolName(String),

    /// CONNECT carried a protocol level other than 4 (MQTT 3.1.1)
    #[error("unsupported protocol level {0}")]
    UnsupportedProtocolLevel(u8),

    /// CONNECT flags have the reserved bit set
    #[error("invalid connect flags 0b{0:08b}")]
    InvalidConnectFlags(u8),

    /// Typed payload could not be encoded for network delivery
    #[error("payload encode error: {0}")]
    PayloadEncode(#[from] serde_json::Error),
}
