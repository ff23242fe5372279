//! SMUX packet model
//!
//! Every framed message on the wire has the same layout:
//!
//! # Frame Format
//! ```text
//! FC 33 [flags] [cmd] [pad_len] [lcid] [len_lo] [len_hi] [payload...] [pad...]
//! ```
//!
//! - `FC 33`: Magic (`0x33FC`, little-endian)
//! - `flags`: Command-specific flag bits
//! - `cmd`: Command code (see [`Command`])
//! - `pad_len`: Number of zero bytes following the payload
//! - `lcid`: Logical channel id, or [`BROADCAST_LCID`]
//! - `len`: Payload length (little-endian `u16`)
//!
//! The [`Command::Byte`] pseudo-command is never framed. It exists so raw
//! control bytes (wakeup request/ack) can travel through the same queues as
//! framed packets; it serializes to the single byte stored in its flags.

use crate::error::{ParseError, ProtocolError};
use crate::{BROADCAST_LCID, MAGIC, MAX_PACKET_SIZE};

/// Size of the fixed packet header
pub const HEADER_SIZE: usize = 8;

/// Largest payload a single DATA packet can carry
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

/// SMUX command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Command {
    /// Channel data
    Data = 0x00,
    /// Open a logical channel (or acknowledge an open)
    Open = 0x01,
    /// Close a logical channel (or acknowledge a close)
    Close = 0x02,
    /// Status (TIOCM) bits update
    Status = 0x03,
    /// Power control (sleep request or ack)
    PowerControl = 0x04,
    /// Delay request, accepted but unused
    Delay = 0x05,
    /// In-memory pseudo-command for a single raw byte
    Byte = 0x06,
}

impl TryFrom<u8> for Command {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Data),
            0x01 => Ok(Self::Open),
            0x02 => Ok(Self::Close),
            0x03 => Ok(Self::Status),
            0x04 => Ok(Self::PowerControl),
            0x05 => Ok(Self::Delay),
            // BYTE never appears framed on the wire
            _ => Err(ParseError::UnknownCommand(value)),
        }
    }
}

impl Command {
    /// Returns a short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Command::Data => "DATA",
            Command::Open => "OPEN",
            Command::Close => "CLOSE",
            Command::Status => "STATUS",
            Command::PowerControl => "PWR_CTL",
            Command::Delay => "DELAY",
            Command::Byte => "BYTE",
        }
    }
}

/// Flag bits for [`Command::Open`]
pub mod open_flags {
    /// Packet acknowledges a previous OPEN
    pub const ACK: u8 = 1 << 0;
    /// Sender supports power collapse
    pub const POWER_COLLAPSE: u8 = 1 << 1;
    /// Sender asks the receiver to loop the channel back
    pub const REMOTE_LOOPBACK: u8 = 1 << 2;
}

/// Flag bits for [`Command::Close`]
pub mod close_flags {
    /// Packet acknowledges a previous CLOSE
    pub const ACK: u8 = 1 << 0;
}

/// Flag bits for [`Command::PowerControl`]
pub mod power_flags {
    /// Packet acknowledges a sleep request
    pub const ACK: u8 = 1 << 0;
}

/// Flag bits for [`Command::Status`]
///
/// These mirror terminal control lines of a serial port.
pub mod status_flags {
    /// Ready to communicate (DTR equivalent)
    pub const RTC: u8 = 1 << 0;
    /// Ready to receive (RTS equivalent)
    pub const RTR: u8 = 1 << 1;
    /// Ring indicator
    pub const RI: u8 = 1 << 2;
    /// Data carrier detect
    pub const DCD: u8 = 1 << 3;
    /// Flow control: sender asks the peer to stop transmitting
    pub const FLOW_CONTROL: u8 = 1 << 4;
}

/// Fixed-size packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Frame magic, always [`MAGIC`] for valid packets
    pub magic: u16,
    /// Command-specific flags
    pub flags: u8,
    /// Command code
    pub cmd: Command,
    /// Number of zero pad bytes after the payload
    pub pad_len: u8,
    /// Logical channel id
    pub lcid: u8,
    /// Payload length in bytes
    pub payload_len: u16,
}

impl PacketHeader {
    /// Create a header with magic prefilled and no payload
    pub fn new(cmd: Command, lcid: u8, flags: u8) -> Self {
        Self {
            magic: MAGIC,
            flags,
            cmd,
            pad_len: 0,
            lcid,
            payload_len: 0,
        }
    }

    /// Encode into the 8-byte wire representation
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let magic = self.magic.to_le_bytes();
        let len = self.payload_len.to_le_bytes();
        [
            magic[0],
            magic[1],
            self.flags,
            self.cmd as u8,
            self.pad_len,
            self.lcid,
            len[0],
            len[1],
        ]
    }

    /// Decode from the start of `data`
    pub fn decode(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < HEADER_SIZE {
            return Err(ParseError::Incomplete {
                needed: HEADER_SIZE - data.len(),
            });
        }

        let magic = u16::from_le_bytes([data[0], data[1]]);
        if magic != MAGIC {
            return Err(ParseError::BadMagic(magic));
        }

        Ok(Self {
            magic,
            flags: data[2],
            cmd: Command::try_from(data[3])?,
            pad_len: data[4],
            lcid: data[5],
            payload_len: u16::from_le_bytes([data[6], data[7]]),
        })
    }

    /// Total frame size declared by this header
    pub fn frame_len(&self) -> usize {
        HEADER_SIZE + self.payload_len as usize + self.pad_len as usize
    }
}

/// A single SMUX packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Packet header
    pub header: PacketHeader,
    /// Owned payload (exactly `header.payload_len` bytes)
    pub payload: Vec<u8>,
}

impl Packet {
    /// Allocate a control packet with no payload
    pub fn new(cmd: Command, lcid: u8, flags: u8) -> Self {
        Self {
            header: PacketHeader::new(cmd, lcid, flags),
            payload: Vec::new(),
        }
    }

    /// Allocate a packet that owns a copy of `data`
    pub fn with_payload(cmd: Command, lcid: u8, data: &[u8]) -> Result<Self, ProtocolError> {
        let payload_len =
            u16::try_from(data.len()).map_err(|_| ProtocolError::PayloadLength(data.len()))?;
        let mut header = PacketHeader::new(cmd, lcid, 0);
        header.payload_len = payload_len;
        Ok(Self {
            header,
            payload: data.to_vec(),
        })
    }

    /// Allocate the raw-byte pseudo-packet
    pub fn byte(value: u8) -> Self {
        Self::new(Command::Byte, BROADCAST_LCID, value)
    }

    /// Broadcast power-control packet
    pub fn power_control(ack: bool) -> Self {
        let flags = if ack { power_flags::ACK } else { 0 };
        Self::new(Command::PowerControl, BROADCAST_LCID, flags)
    }

    /// Command of this packet
    pub fn cmd(&self) -> Command {
        self.header.cmd
    }

    /// Logical channel of this packet
    pub fn lcid(&self) -> u8 {
        self.header.lcid
    }

    /// Flags of this packet
    pub fn flags(&self) -> u8 {
        self.header.flags
    }

    /// Check whether all bits of `mask` are set in the flags
    pub fn has_flags(&self, mask: u8) -> bool {
        self.header.flags & mask == mask
    }

    /// Size of this packet once serialized
    pub fn serialized_len(&self) -> usize {
        match self.header.cmd {
            Command::Byte => 1,
            _ => HEADER_SIZE + self.payload.len() + self.header.pad_len as usize,
        }
    }

    /// Serialize header, payload and padding onto the end of `out`
    ///
    /// Returns the number of bytes written.
    pub fn serialize(&self, out: &mut Vec<u8>) -> Result<usize, ProtocolError> {
        if self.header.cmd == Command::Byte {
            out.push(self.header.flags);
            return Ok(1);
        }

        let size = self.serialized_len();
        if size > MAX_PACKET_SIZE {
            return Err(ProtocolError::PacketTooLarge {
                size,
                max: MAX_PACKET_SIZE,
            });
        }
        if self.payload.len() != self.header.payload_len as usize {
            return Err(ParseError::LengthMismatch {
                declared: self.header.payload_len as usize,
                actual: self.payload.len(),
            }
            .into());
        }

        out.reserve(size);
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out.resize(out.len() + self.header.pad_len as usize, 0);
        Ok(size)
    }

    /// Serialize into a fresh buffer
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(self.serialized_len());
        self.serialize(&mut out)?;
        Ok(out)
    }

    /// Deserialize a complete frame (header, payload and pad)
    pub fn deserialize(frame: &[u8]) -> Result<Self, ParseError> {
        let header = PacketHeader::decode(frame)?;
        let declared = header.frame_len();
        if declared != frame.len() {
            return Err(ParseError::LengthMismatch {
                declared,
                actual: frame.len(),
            });
        }

        let end = HEADER_SIZE + header.payload_len as usize;
        Ok(Self {
            header,
            payload: frame[HEADER_SIZE..end].to_vec(),
        })
    }
}
