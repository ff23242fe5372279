//! Channel notifications
//!
//! Every state change a client can observe is delivered as a [`ChannelEvent`]
//! through [`ChannelClient::notify`](crate::ChannelClient::notify), in the
//! order the engine raised it.

/// Notification delivered to a channel client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    // -------------------------------------------------------------------------
    // Lifecycle events
    // -------------------------------------------------------------------------
    /// Both halves of the channel are open
    Connected,

    /// Both halves of the channel are closed
    Disconnected {
        /// Closed by a transport reset rather than a close handshake
        transport_reset: bool,
    },

    /// Our close was acknowledged (or the open was withdrawn before sending)
    LocalClosed,

    /// The peer closed its half
    RemoteClosed,

    // -------------------------------------------------------------------------
    // Data events
    // -------------------------------------------------------------------------
    /// A DATA packet was delivered into a client buffer
    ReadDone {
        /// Received payload
        data: Vec<u8>,
    },

    /// A received DATA packet could not be delivered and was dropped
    ReadFail {
        /// Payload length of the lost packet
        len: usize,
    },

    /// A write was handed to the transport
    WriteDone {
        /// Token passed to [`MuxEngine::write`](crate::MuxEngine::write)
        token: u64,
        /// Bytes of payload written
        len: usize,
    },

    /// A write was discarded before reaching the transport
    WriteFail {
        /// Token passed to [`MuxEngine::write`](crate::MuxEngine::write)
        token: u64,
    },

    // -------------------------------------------------------------------------
    // Status and flow control events
    // -------------------------------------------------------------------------
    /// The peer's modem status bits changed
    TiocmUpdate {
        /// TIOCM bits before the change
        old: u32,
        /// TIOCM bits after the change
        new: u32,
    },

    /// Pending transmit data drained to the low watermark
    LowWatermark,

    /// Pending transmit data reached the high watermark
    HighWatermark,

    /// Receive retry queue reached its high watermark; peer told to stop
    RxRetryHighWatermark,

    /// Receive retry queue drained; peer allowed to resume
    RxRetryLowWatermark,
}

impl ChannelEvent {
    /// Returns true for open/close lifecycle events
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            ChannelEvent::Connected
                | ChannelEvent::Disconnected { .. }
                | ChannelEvent::LocalClosed
                | ChannelEvent::RemoteClosed
        )
    }

    /// Returns true for read/write completion events
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            ChannelEvent::ReadDone { .. }
                | ChannelEvent::ReadFail { .. }
                | ChannelEvent::WriteDone { .. }
                | ChannelEvent::WriteFail { .. }
        )
    }

    /// Short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Connected => "CONNECTED",
            ChannelEvent::Disconnected { .. } => "DISCONNECTED",
            ChannelEvent::LocalClosed => "LOCAL_CLOSED",
            ChannelEvent::RemoteClosed => "REMOTE_CLOSED",
            ChannelEvent::ReadDone { .. } => "READ_DONE",
            ChannelEvent::ReadFail { .. } => "READ_FAIL",
            ChannelEvent::WriteDone { .. } => "WRITE_DONE",
            ChannelEvent::WriteFail { .. } => "WRITE_FAIL",
            ChannelEvent::TiocmUpdate { .. } => "TIOCM_UPDATE",
            ChannelEvent::LowWatermark => "LOW_WM_HIT",
            ChannelEvent::HighWatermark => "HIGH_WM_HIT",
            ChannelEvent::RxRetryHighWatermark => "RX_RETRY_HIGH_WM_HIT",
            ChannelEvent::RxRetryLowWatermark => "RX_RETRY_LOW_WM_HIT",
        }
    }
}
