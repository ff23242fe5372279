//! Error types for the multiplexer engine

use thiserror::Error;

/// Broad classification of engine errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed wire data (always recovered internally)
    ProtocolFraming,
    /// Operation not valid in the channel's current state
    ChannelStateViolation,
    /// A queue or buffer limit was hit
    ResourceExhaustion,
    /// The client broke the API contract (bad id, oversize write)
    ClientContractViolation,
    /// The transport failed to carry bytes
    TransportFatal,
}

/// Errors returned by the channel API
#[derive(Debug, Error)]
pub enum MuxError {
    /// Channel id outside the configured range
    #[error("invalid channel id: {0}")]
    InvalidChannel(u8),

    /// Channel is not in a state that allows this operation
    #[error("channel {lcid} is not open")]
    ChannelNotOpen { lcid: u8 },

    /// Open requested on a channel that is already open or opening
    #[error("channel {lcid} is already open")]
    AlreadyOpen { lcid: u8 },

    /// Channel is still closing; retry later
    #[error("channel {lcid} is closing, try again")]
    TryAgain { lcid: u8 },

    /// Pending transmit data reached the high watermark
    #[error("channel {lcid} would overflow: {pending} packets pending")]
    WouldOverflow { lcid: u8, pending: usize },

    /// Write larger than a single packet can carry
    #[error("write of {len} bytes exceeds maximum payload of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    /// Protocol error while building a packet
    #[error("protocol error: {0}")]
    Protocol(#[from] smux_protocol::ProtocolError),

    /// Transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

impl MuxError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            MuxError::InvalidChannel(_) | MuxError::PayloadTooLarge { .. } => {
                ErrorKind::ClientContractViolation
            }
            MuxError::ChannelNotOpen { .. }
            | MuxError::AlreadyOpen { .. }
            | MuxError::TryAgain { .. } => ErrorKind::ChannelStateViolation,
            MuxError::WouldOverflow { .. } => ErrorKind::ResourceExhaustion,
            MuxError::Protocol(_) => ErrorKind::ProtocolFraming,
            MuxError::Transport(_) => ErrorKind::TransportFatal,
        }
    }
}

/// Errors reported by a [`Transport`](crate::Transport)
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serial port error
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The write could not be completed within the retry budget
    #[error("short write: {written} of {len} bytes")]
    ShortWrite { written: usize, len: usize },

    /// The transport has been closed
    #[error("transport closed")]
    Closed,
}
