//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Multiplexer engine configuration
///
/// All fields have defaults, so a partial JSON document is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MuxConfig {
    /// Number of logical channels (ids `0..num_channels`)
    pub num_channels: u8,
    /// Capacity of the notification FIFO
    pub notify_fifo_size: usize,
    /// Local side supports power collapse (sleep negotiation)
    pub power_collapse: bool,
    /// Feed every transmitted byte straight back into the receive path
    pub byte_loopback: bool,
    /// Idle time before a sleep request is considered (ms)
    pub inactivity_timeout_ms: u64,
    /// First wakeup request resend delay (us)
    pub wakeup_delay_min_us: u64,
    /// Cap on the wakeup resend delay (us)
    pub wakeup_delay_max_us: u64,
    /// Wake delays below this are slept without yielding to new work (us)
    pub wakeup_inline_threshold_us: u64,
    /// First receive retry delay (ms)
    pub rx_retry_min_ms: u64,
    /// Receive retry delay beyond which a packet is abandoned (ms)
    pub rx_retry_max_ms: u64,
    /// Retry queue bound per channel
    pub rx_retry_max_pkts: usize,
    /// Pending transmit DATA count that raises the high watermark
    pub tx_wm_high: usize,
    /// Pending transmit DATA count that raises the low watermark
    pub tx_wm_low: usize,
    /// Retry queue depth that asserts automatic remote flow control
    pub rx_wm_high: usize,
    /// Retry queue depth that releases automatic remote flow control
    pub rx_wm_low: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            num_channels: 16,
            notify_fifo_size: 128,
            power_collapse: false,
            byte_loopback: false,
            inactivity_timeout_ms: 1000,
            wakeup_delay_min_us: 1,
            wakeup_delay_max_us: 1_000_000,
            wakeup_inline_threshold_us: 32_768,
            rx_retry_min_ms: 1,
            rx_retry_max_ms: 1024,
            rx_retry_max_pkts: 32,
            tx_wm_high: 4,
            tx_wm_low: 2,
            rx_wm_high: 16,
            rx_wm_low: 4,
        }
    }
}

impl MuxConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn wakeup_delay_min(&self) -> Duration {
        Duration::from_micros(self.wakeup_delay_min_us)
    }

    pub fn wakeup_delay_max(&self) -> Duration {
        Duration::from_micros(self.wakeup_delay_max_us)
    }

    pub fn wakeup_inline_threshold(&self) -> Duration {
        Duration::from_micros(self.wakeup_inline_threshold_us)
    }

    pub fn rx_retry_min(&self) -> Duration {
        Duration::from_millis(self.rx_retry_min_ms)
    }

    pub fn rx_retry_max(&self) -> Duration {
        Duration::from_millis(self.rx_retry_max_ms)
    }
}
