//! Error types for SMUX packet parsing and encoding

use thiserror::Error;

/// Errors that can occur while parsing wire data
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Buffer is incomplete - need more data
    #[error("incomplete data: need {needed} more bytes")]
    Incomplete { needed: usize },

    /// Header magic does not match
    #[error("bad magic: 0x{0:04X}")]
    BadMagic(u16),

    /// Unknown command byte
    #[error("unknown command: 0x{0:02X}")]
    UnknownCommand(u8),

    /// Declared lengths are inconsistent with the frame
    #[error("invalid frame length: declared {declared} bytes, frame holds {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    /// Declared frame exceeds the maximum packet size
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Higher-level protocol errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Parse error
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Serialized packet would exceed the maximum packet size
    #[error("packet too large: {size} bytes exceeds maximum of {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// Payload does not fit the 16-bit length field
    #[error("payload length {0} does not fit the header")]
    PayloadLength(usize),
}
