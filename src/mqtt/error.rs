//! Wire codec error types

use std::fmt;

/// Errors that can occur while encoding an outbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Packet exceeds the maximum remaining length
    PacketTooLarge,
    /// String exceeds the 64 KiB length prefix
    StringTooLong,
    /// Packet identifier 0 is reserved
    InvalidPacketId,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string exceeds maximum length"),
            Self::InvalidPacketId => write!(f, "packet identifier must be non-zero"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Errors that can occur while decoding a broker response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Invalid remaining length encoding
    InvalidRemainingLength,
    /// Remaining length exceeds maximum
    RemainingLengthTooLarge,
    /// Malformed packet
    MalformedPacket(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidRemainingLength => write!(f, "invalid remaining length encoding"),
            Self::RemainingLengthTooLarge => write!(f, "remaining length exceeds maximum"),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}
