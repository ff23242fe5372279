//! Channel and link state types

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Local half of a logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LocalState {
    #[default]
    Closed,
    /// OPEN queued or sent, waiting for the ack
    Opening,
    Opened,
    /// CLOSE queued or sent, waiting for the ack
    Closing,
}

/// Remote half of a logical channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RemoteState {
    #[default]
    Closed,
    Opened,
}

/// Channel operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ChannelMode {
    #[default]
    Normal,
    /// Transmitted packets are fed back into our own receive path
    LocalLoopback,
    /// The peer echoes our traffic back
    RemoteLoopback,
}

/// Link power state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerState {
    #[default]
    Off,
    /// Wakeup requested, waiting for the ack
    TurningOn,
    On,
    /// Sleep request or ack queued, not yet transmitted
    TurningOffFlush,
    /// Sleep request transmitted, waiting for the ack
    TurningOff,
    /// Sleep agreed; powering down once the transmit path is quiet
    OffFlush,
}

impl PowerState {
    /// Whether the link is on its way down
    pub fn is_turning_off(&self) -> bool {
        matches!(
            self,
            PowerState::TurningOffFlush | PowerState::TurningOff | PowerState::OffFlush
        )
    }
}

/// Point-in-time view of one logical channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSnapshot {
    pub lcid: u8,
    pub local_state: LocalState,
    pub remote_state: RemoteState,
    pub local_mode: ChannelMode,
    pub remote_mode: ChannelMode,
    /// Local STATUS bits
    pub local_status: u8,
    /// Last STATUS bits received from the peer
    pub remote_status: u8,
    /// Packets waiting in the transmit queue (all commands)
    pub tx_queue_len: usize,
    /// DATA packets waiting to be sent
    pub tx_pending_data: usize,
    /// Packets waiting for a receive buffer
    pub rx_retry_len: usize,
    /// Peer asked us to stop sending
    pub tx_flow_control: bool,
    /// We asked the peer to stop sending
    pub rx_flow_control: bool,
    pub has_client: bool,
}

impl ChannelSnapshot {
    pub fn is_fully_open(&self) -> bool {
        self.local_state == LocalState::Opened && self.remote_state == RemoteState::Opened
    }
}

/// Engine counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MuxStats {
    /// Wakeups we initiated and the peer acknowledged
    pub local_wakeups: u64,
    /// Wakeups the peer initiated
    pub remote_wakeups: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Times the receive parser entered FAILURE
    pub parser_failures: u64,
    /// Notifications lost to a full FIFO
    pub dropped_notifications: u64,
    /// Received packets abandoned after exhausting retries
    pub retry_abandoned: u64,
    pub transport_errors: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Stats {
    pub local_wakeups: AtomicU64,
    pub remote_wakeups: AtomicU64,
    pub packets_sent: AtomicU64,
    pub packets_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub parser_failures: AtomicU64,
    pub dropped_notifications: AtomicU64,
    pub retry_abandoned: AtomicU64,
    pub transport_errors: AtomicU64,
}

impl Stats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MuxStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MuxStats {
            local_wakeups: get(&self.local_wakeups),
            remote_wakeups: get(&self.remote_wakeups),
            packets_sent: get(&self.packets_sent),
            packets_received: get(&self.packets_received),
            bytes_sent: get(&self.bytes_sent),
            bytes_received: get(&self.bytes_received),
            parser_failures: get(&self.parser_failures),
            dropped_notifications: get(&self.dropped_notifications),
            retry_abandoned: get(&self.retry_abandoned),
            transport_errors: get(&self.transport_errors),
        }
    }
}
