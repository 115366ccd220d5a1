//! Protocol error types

use std::fmt;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Invalid packet type nibble (0 and 15 are reserved)
    InvalidPacketType(u8),
    /// Remaining length continuation ran past four bytes
    MalformedRemainingLength,
    /// Fixed header flags do not match the packet type
    InvalidFlags,
    /// A QoS field decoded to 3
    InvalidQoS(u8),
    /// A required packet identifier was zero
    InvalidPacketIdentifier,
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Packet exceeds the configured maximum size
    PacketTooLarge,
    /// Malformed packet
    MalformedPacket(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::MalformedRemainingLength => write!(f, "malformed remaining length encoding"),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidPacketIdentifier => write!(f, "invalid packet identifier"),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// A string or binary blob exceeds 65535 bytes
    InvalidLength,
    /// Remaining length exceeds the protocol maximum
    PacketTooLarge,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidLength => write!(f, "string or binary data too long"),
            Self::PacketTooLarge => write!(f, "packet too large"),
        }
    }
}

impl std::error::Error for EncodeError {}
