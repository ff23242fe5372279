//! Logical channel control block

use std::collections::VecDeque;
use std::sync::Arc;

use smux_protocol::{open_flags, status_flags, tiocm, Command, Packet};
use tokio_util::sync::CancellationToken;

use crate::client::ChannelClient;
use crate::flow::RetryState;
use crate::state::{ChannelMode, ChannelSnapshot, LocalState, RemoteState};

/// Channel option bits for [`MuxEngine::set_option`](crate::MuxEngine::set_option)
pub mod options {
    /// Loop transmitted packets back into our own receive path
    pub const LOCAL_LOOPBACK: u32 = 1 << 0;
    /// Ask the peer to echo our traffic (takes effect on the next open)
    pub const REMOTE_LOOPBACK: u32 = 1 << 1;
    /// Tell the peer to stop sending
    pub const REMOTE_TX_STOP: u32 = 1 << 2;
    /// Tell the peer to stop sending while the receive retry queue is deep
    pub const AUTO_REMOTE_TX_STOP: u32 = 1 << 3;
}

/// A packet waiting in a channel transmit queue
#[derive(Debug)]
pub(crate) struct TxEntry {
    pub packet: Packet,
    /// Client write token, for DATA written through the API
    pub token: Option<u64>,
}

/// A received DATA packet waiting for a client buffer
#[derive(Debug)]
pub(crate) struct RetryEntry {
    pub packet: Packet,
    pub retry: RetryState,
}

pub(crate) struct Channel {
    pub lcid: u8,
    pub local_state: LocalState,
    pub remote_state: RemoteState,
    pub local_mode: ChannelMode,
    pub remote_mode: ChannelMode,
    pub local_status: u8,
    pub remote_status: u8,
    pub auto_remote_tx_stop: bool,

    pub tx_queue: VecDeque<TxEntry>,
    pub tx_pending_data: usize,
    pub notify_lwm: bool,
    pub tx_flow_control: bool,

    pub rx_flow_control_auto: bool,
    pub rx_flow_control_client: bool,
    pub retry_queue: VecDeque<RetryEntry>,
    pub retry_task: Option<CancellationToken>,

    pub client: Option<Arc<dyn ChannelClient>>,
    /// Bumped whenever a session ends; completions from an older
    /// generation are not reported
    pub generation: u64,
}

impl Channel {
    pub fn new(lcid: u8) -> Self {
        Self {
            lcid,
            local_state: LocalState::Closed,
            remote_state: RemoteState::Closed,
            local_mode: ChannelMode::Normal,
            remote_mode: ChannelMode::Normal,
            local_status: 0,
            remote_status: 0,
            auto_remote_tx_stop: false,
            tx_queue: VecDeque::new(),
            tx_pending_data: 0,
            notify_lwm: false,
            tx_flow_control: false,
            rx_flow_control_auto: false,
            rx_flow_control_client: false,
            retry_queue: VecDeque::new(),
            retry_task: None,
            client: None,
            generation: 0,
        }
    }

    pub fn is_fully_open(&self) -> bool {
        self.local_state == LocalState::Opened && self.remote_state == RemoteState::Opened
    }

    /// DATA may flow on this channel (fully open, or echoing for the peer)
    pub fn accepts_data(&self) -> bool {
        self.is_fully_open() || self.remote_mode == ChannelMode::RemoteLoopback
    }

    /// Next packet the scheduler may send
    ///
    /// DATA at the head is held back while the peer has us flow controlled
    /// or the channel cannot carry data; control packets queued behind it
    /// still go out. `None` means nothing is sendable and the channel should
    /// leave the ready list until something changes.
    pub fn next_tx(&mut self) -> Option<TxEntry> {
        if !self.tx_flow_control && self.accepts_data() {
            return self.tx_queue.pop_front();
        }
        let pos = self
            .tx_queue
            .iter()
            .position(|e| e.packet.cmd() != Command::Data)?;
        self.tx_queue.remove(pos)
    }

    /// Remove queued DATA and our own unsent OPEN
    ///
    /// Returns the tokens of discarded client writes and whether an OPEN
    /// request was withdrawn. Acks and status owed to the peer stay queued.
    pub fn purge_tx(&mut self) -> (Vec<u64>, bool) {
        let mut failed = Vec::new();
        let mut open_withdrawn = false;
        self.tx_queue.retain(|entry| match entry.packet.cmd() {
            Command::Data => {
                failed.extend(entry.token);
                false
            }
            Command::Open if !entry.packet.has_flags(open_flags::ACK) => {
                open_withdrawn = true;
                false
            }
            _ => true,
        });
        self.tx_pending_data = 0;
        self.notify_lwm = false;
        (failed, open_withdrawn)
    }

    /// Drop every queued packet, returning the tokens of discarded writes
    pub fn clear_tx(&mut self) -> Vec<u64> {
        let failed = self.tx_queue.drain(..).filter_map(|e| e.token).collect();
        self.tx_pending_data = 0;
        self.notify_lwm = false;
        failed
    }

    /// Cancel the retry task and discard all retry records
    ///
    /// Returns the payload lengths of the discarded packets.
    pub fn purge_retry(&mut self) -> Vec<usize> {
        if let Some(token) = self.retry_task.take() {
            token.cancel();
        }
        self.retry_queue
            .drain(..)
            .map(|e| e.packet.payload.len())
            .collect()
    }

    /// Forget everything learned from the peer during the ended session
    ///
    /// Flow control in either direction starts released on the next open.
    pub fn end_session(&mut self) {
        self.remote_mode = ChannelMode::Normal;
        self.remote_status = 0;
        self.tx_flow_control = false;
        self.rx_flow_control_auto = false;
        self.rx_flow_control_client = false;
        self.update_rx_flow_bit();
        self.generation = self.generation.wrapping_add(1);
    }

    /// Recompute the FLOW bit from both flow-control sources
    ///
    /// Returns true if the local status changed.
    pub fn update_rx_flow_bit(&mut self) -> bool {
        let old = self.local_status;
        if self.rx_flow_control_auto || self.rx_flow_control_client {
            self.local_status |= status_flags::FLOW_CONTROL;
        } else {
            self.local_status &= !status_flags::FLOW_CONTROL;
        }
        old != self.local_status
    }

    /// TIOCM view of the channel's status bits
    pub fn tiocm(&self) -> u32 {
        let mut bits = 0;
        let remote = self.remote_status;
        let local = self.local_status;

        if remote & status_flags::RTC != 0 {
            bits |= tiocm::DSR;
        }
        if remote & status_flags::RTR != 0 {
            bits |= tiocm::CTS;
        }
        if remote & status_flags::RI != 0 {
            bits |= tiocm::RI;
        }
        if remote & status_flags::DCD != 0 {
            bits |= tiocm::CD;
        }
        if local & status_flags::RTC != 0 {
            bits |= tiocm::DTR;
        }
        if local & status_flags::RTR != 0 {
            bits |= tiocm::RTS;
        }
        bits
    }

    /// Apply TIOCM set/clear masks to the local status
    ///
    /// Returns true if the local status changed.
    pub fn apply_tiocm(&mut self, set: u32, clear: u32) -> bool {
        let old = self.local_status;
        let map = [(tiocm::DTR, status_flags::RTC), (tiocm::RTS, status_flags::RTR)];
        for (tiocm_bit, status_bit) in map {
            if set & tiocm_bit != 0 {
                self.local_status |= status_bit;
            }
            if clear & tiocm_bit != 0 {
                self.local_status &= !status_bit;
            }
        }
        old != self.local_status
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            lcid: self.lcid,
            local_state: self.local_state,
            remote_state: self.remote_state,
            local_mode: self.local_mode,
            remote_mode: self.remote_mode,
            local_status: self.local_status,
            remote_status: self.remote_status,
            tx_queue_len: self.tx_queue.len(),
            tx_pending_data: self.tx_pending_data,
            rx_retry_len: self.retry_queue.len(),
            tx_flow_control: self.tx_flow_control,
            rx_flow_control: self.local_status & status_flags::FLOW_CONTROL != 0,
            has_client: self.client.is_some(),
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("lcid", &self.lcid)
            .field("local_state", &self.local_state)
            .field("remote_state", &self.remote_state)
            .field("local_mode", &self.local_mode)
            .field("remote_mode", &self.remote_mode)
            .field("tx_queue", &self.tx_queue.len())
            .field("retry_queue", &self.retry_queue.len())
            .finish_non_exhaustive()
    }
}
