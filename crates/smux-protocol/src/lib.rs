//! SMUX Protocol Library
//!
//! This crate provides the wire format of the SMUX serial multiplexing
//! protocol, which carries many logical channels over one byte stream:
//!
//! - **Packets**: 8-byte header, payload and zero padding ([`packet`])
//! - **Control bytes**: single unframed bytes for the sleep/wake handshake
//! - **Receive parser**: a streaming state machine that survives arbitrary
//!   chunk boundaries and reacts to reception errors ([`parser`])
//!
//! # Example
//!
//! ```rust
//! use smux_protocol::{Command, Packet, RxFlag, RxItem, RxParser};
//!
//! let pkt = Packet::with_payload(Command::Data, 2, b"ping").unwrap();
//! let bytes = pkt.to_bytes().unwrap();
//!
//! let mut parser = RxParser::new();
//! let (head, tail) = bytes.split_at(5);
//! parser.feed(head, RxFlag::Normal);
//! parser.feed(tail, RxFlag::Normal);
//!
//! assert_eq!(parser.next_item(), Some(RxItem::Packet(pkt)));
//! ```

pub mod error;
pub mod packet;
pub mod parser;

pub use error::{ParseError, ProtocolError};
pub use packet::{
    close_flags, open_flags, power_flags, status_flags, Command, Packet, PacketHeader,
    HEADER_SIZE, MAX_PAYLOAD_SIZE,
};
pub use parser::{RxFlag, RxItem, RxParser, RxState};

/// Frame magic as a little-endian word
pub const MAGIC: u16 = 0x33FC;
/// First byte of the frame magic on the wire
pub const MAGIC_WORD1: u8 = 0xFC;
/// Second byte of the frame magic on the wire
pub const MAGIC_WORD2: u8 = 0x33;

/// Raw byte: request the peer to wake up
pub const WAKEUP_REQ: u8 = 0xFD;
/// Raw byte: acknowledge a wakeup request
pub const WAKEUP_ACK: u8 = 0xFE;

/// Raw byte (test mode): echo request
pub const ECHO_REQ: u8 = 0xF0;
/// Raw byte (test mode): echo acknowledged
pub const ECHO_ACK_OK: u8 = 0xF1;
/// Raw byte (test mode): echo failed
pub const ECHO_ACK_FAIL: u8 = 0xF2;

/// Maximum serialized packet size (header + payload + pad)
pub const MAX_PACKET_SIZE: usize = 8192;

/// Reserved channel id for broadcast packets (power control)
pub const BROADCAST_LCID: u8 = 0xFF;

/// TIOCM-style modem status bits exposed to channel clients
///
/// Values match the conventional Unix `TIOCM_*` constants.
pub mod tiocm {
    /// Data terminal ready (local)
    pub const DTR: u32 = 0x002;
    /// Request to send (local)
    pub const RTS: u32 = 0x004;
    /// Clear to send (remote RTR)
    pub const CTS: u32 = 0x020;
    /// Carrier detect (remote DCD)
    pub const CD: u32 = 0x040;
    /// Ring indicator (remote RI)
    pub const RI: u32 = 0x080;
    /// Data set ready (remote RTC)
    pub const DSR: u32 = 0x100;
}
