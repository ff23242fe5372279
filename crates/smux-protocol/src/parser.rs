//! Streaming receive parser
//!
//! The parser consumes raw chunks from the transport, tagged with the
//! reception flags the driver reported (one per chunk or one per byte), and
//! reconstitutes packets.
//!
//! ```text
//!         FC            33                8 bytes            len + pad
//! IDLE -------> MAGIC -------> HEADER -------------> PAYLOAD -----------> IDLE
//!   ^             | other        | error flag           | error flag
//!   +-------------+              +-------> FAILURE <----+
//! ```
//!
//! Outside a frame the parser also recognizes the single-byte power signals
//! ([`WAKEUP_REQ`], [`WAKEUP_ACK`]) and the echo bytes of the byte-loopback
//! test mode. A reception error while a frame is being
//! assembled is fatal: the parser stays in [`RxState::Failure`] until
//! [`RxParser::reset`] is called by the owner of the transport session.

use std::collections::VecDeque;

use tracing::{debug, error, warn};

use crate::packet::{Packet, HEADER_SIZE};
use crate::{
    ECHO_ACK_FAIL, ECHO_ACK_OK, ECHO_REQ, MAGIC_WORD1, MAGIC_WORD2, MAX_PACKET_SIZE, WAKEUP_ACK,
    WAKEUP_REQ,
};

/// Reception flag reported by the transport for received bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxFlag {
    /// Bytes were received cleanly
    #[default]
    Normal,
    /// Line break condition
    Break,
    /// Framing error
    Frame,
    /// Parity error
    Parity,
    /// Receiver overrun
    Overrun,
}

impl RxFlag {
    /// Whether this flag signals a reception error
    pub fn is_error(&self) -> bool {
        !matches!(self, RxFlag::Normal)
    }
}

/// Receive parser state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Scanning for a frame start or a control byte
    Idle,
    /// First magic byte seen
    Magic,
    /// Accumulating the fixed header
    Header,
    /// Accumulating payload and padding
    Payload,
    /// Unrecoverable reception error, waiting for reset
    Failure,
}

/// Items produced by the parser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxItem {
    /// A complete framed packet
    Packet(Packet),
    /// Peer asks us to wake up
    WakeupRequest,
    /// Peer acknowledged our wakeup request
    WakeupAck,
    /// Byte-loopback test mode: peer asks for an echo ack
    EchoRequest,
    /// Byte-loopback test mode: answer to an echo request
    EchoAck { ok: bool },
}

/// Streaming SMUX receive parser
pub struct RxParser {
    state: RxState,
    buffer: Vec<u8>,
    remaining: usize,
    items: VecDeque<RxItem>,
}

impl RxParser {
    /// Create a parser in the idle state
    pub fn new() -> Self {
        Self {
            state: RxState::Idle,
            buffer: Vec::with_capacity(MAX_PACKET_SIZE),
            remaining: 0,
            items: VecDeque::new(),
        }
    }

    /// Current parser state
    pub fn state(&self) -> RxState {
        self.state
    }

    /// Whether the parser hit an unrecoverable error
    pub fn is_failed(&self) -> bool {
        self.state == RxState::Failure
    }

    /// Return to idle, dropping any partial frame and unread items
    pub fn reset(&mut self) {
        self.state = RxState::Idle;
        self.buffer.clear();
        self.remaining = 0;
        self.items.clear();
    }

    /// Consume a chunk of received bytes that all carry the same flag
    ///
    /// The whole chunk is consumed; completed items are available through
    /// [`RxParser::next_item`].
    pub fn feed(&mut self, data: &[u8], flag: RxFlag) {
        if self.state == RxState::Failure {
            debug!("rx parser in failure state, dropping {} bytes", data.len());
            return;
        }
        for &byte in data {
            self.push(byte, flag);
        }
    }

    /// Consume a chunk of received bytes with one flag per byte
    ///
    /// `flags[i]` applies to `data[i]`; bytes past the end of `flags` are
    /// treated as [`RxFlag::Normal`]. A flagged byte only affects the parser
    /// at its own position, so clean bytes after it in the same chunk are
    /// still parsed.
    pub fn feed_flagged(&mut self, data: &[u8], flags: &[RxFlag]) {
        if self.state == RxState::Failure {
            debug!("rx parser in failure state, dropping {} bytes", data.len());
            return;
        }
        for (i, &byte) in data.iter().enumerate() {
            self.push(byte, flags.get(i).copied().unwrap_or_default());
        }
    }

    /// Take the next parsed item
    pub fn next_item(&mut self) -> Option<RxItem> {
        self.items.pop_front()
    }

    fn push(&mut self, byte: u8, flag: RxFlag) {
        match self.state {
            RxState::Idle => self.handle_idle(byte, flag),
            RxState::Magic => self.handle_magic(byte, flag),
            RxState::Header => self.handle_header(byte, flag),
            RxState::Payload => self.handle_payload(byte, flag),
            RxState::Failure => {}
        }
    }

    fn handle_idle(&mut self, byte: u8, flag: RxFlag) {
        if flag.is_error() {
            debug!("rx error {:?} while idle, ignoring 0x{:02X}", flag, byte);
            return;
        }

        match byte {
            MAGIC_WORD1 => self.state = RxState::Magic,
            WAKEUP_REQ => self.items.push_back(RxItem::WakeupRequest),
            WAKEUP_ACK => self.items.push_back(RxItem::WakeupAck),
            ECHO_REQ => self.items.push_back(RxItem::EchoRequest),
            ECHO_ACK_OK => self.items.push_back(RxItem::EchoAck { ok: true }),
            ECHO_ACK_FAIL => self.items.push_back(RxItem::EchoAck { ok: false }),
            _ => warn!("rx unexpected byte 0x{:02X} while idle", byte),
        }
    }

    fn handle_magic(&mut self, byte: u8, flag: RxFlag) {
        if flag.is_error() {
            error!("rx error {:?} after magic byte, parser failed", flag);
            self.state = RxState::Failure;
            return;
        }

        if byte == MAGIC_WORD2 {
            self.buffer.clear();
            self.buffer.extend_from_slice(&[MAGIC_WORD1, MAGIC_WORD2]);
            self.state = RxState::Header;
        } else {
            // Resync: let idle look at this byte again, it may start a frame
            debug!("rx magic mismatch 0x{:02X}, resyncing", byte);
            self.state = RxState::Idle;
            self.handle_idle(byte, flag);
        }
    }

    fn handle_header(&mut self, byte: u8, flag: RxFlag) {
        if flag.is_error() {
            error!("rx error {:?} inside header, parser failed", flag);
            self.state = RxState::Failure;
            return;
        }

        self.buffer.push(byte);
        if self.buffer.len() < HEADER_SIZE {
            return;
        }

        let pad_len = self.buffer[4] as usize;
        let payload_len = u16::from_le_bytes([self.buffer[6], self.buffer[7]]) as usize;
        let frame_len = HEADER_SIZE + payload_len + pad_len;

        if frame_len > MAX_PACKET_SIZE {
            warn!("rx frame of {} bytes exceeds maximum, resyncing", frame_len);
            self.buffer.clear();
            self.state = RxState::Idle;
        } else if payload_len + pad_len == 0 {
            self.complete_frame();
        } else {
            self.remaining = payload_len + pad_len;
            self.state = RxState::Payload;
        }
    }

    fn handle_payload(&mut self, byte: u8, flag: RxFlag) {
        if flag.is_error() {
            error!("rx error {:?} inside payload, parser failed", flag);
            self.state = RxState::Failure;
            return;
        }

        self.buffer.push(byte);
        self.remaining -= 1;
        if self.remaining == 0 {
            self.complete_frame();
        }
    }

    fn complete_frame(&mut self) {
        match Packet::deserialize(&self.buffer) {
            Ok(pkt) => {
                debug!(
                    "rx {} lcid {} flags 0x{:02X} len {}",
                    pkt.cmd().name(),
                    pkt.lcid(),
                    pkt.flags(),
                    pkt.payload.len()
                );
                self.items.push_back(RxItem::Packet(pkt));
            }
            Err(e) => warn!("rx dropping malformed frame: {}", e),
        }

        self.buffer.clear();
        self.remaining = 0;
        self.state = RxState::Idle;
    }
}

impl Default for RxParser {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RxParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RxParser")
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .field("remaining", &self.remaining)
            .field("pending_items", &self.items.len())
            .finish()
    }
}
