use thiserror::Error;

pub type Result<T> = std::result::Result<T, WireError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("String too long: {0} bytes exceeds 65535")]
    StringTooLong(usize),

    #[error("Remaining length too large: {0} exceeds 268435455")]
    RemainingLengthTooLarge(usize),

    #[error("Malformed variable byte integer")]
    MalformedVariableInt,

    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unexpected packet type: expected {expected}, got 0x{actual:02X}")]
    UnexpectedPacketType { expected: &'static str, actual: u8 },

    #[error("Packet identifier required for QoS {0}")]
    MissingPacketId(u8),

    #[error("Invalid QoS: {0}")]
    InvalidQoS(u8),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("Unknown property identifier: 0x{0:02X}")]
    UnknownProperty(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,
}
