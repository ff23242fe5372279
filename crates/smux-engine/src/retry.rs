//! Receive retry queue
//!
//! A DATA packet the client has no buffer for waits in its channel's retry
//! queue. A per-channel task retries the head with exponential backoff;
//! later packets wait behind it so delivery order is preserved.

use std::time::Duration;

use smux_protocol::Packet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{Channel, RetryEntry};
use crate::client::RxBufferError;
use crate::engine::{EngineState, MuxEngine};
use crate::events::ChannelEvent;
use crate::flow::{Crossing, RetryState};
use crate::state::Stats;

impl MuxEngine {
    /// Park a received DATA packet until the client has a buffer for it
    pub(crate) fn queue_retry(&self, st: &mut EngineState, ch: &mut Channel, packet: Packet) {
        let config = &self.inner.config;
        let len = packet.payload.len();

        if ch.retry_queue.len() >= config.rx_retry_max_pkts {
            warn!(
                "Channel {} retry queue full, dropping {} byte packet",
                ch.lcid, len
            );
            self.notify(ch, ChannelEvent::ReadFail { len });
            return;
        }

        let retry = RetryState::new(config.rx_retry_min());
        ch.retry_queue.push_back(RetryEntry { packet, retry });
        debug!(
            "Channel {} queued {} bytes for retry ({} waiting)",
            ch.lcid,
            len,
            ch.retry_queue.len()
        );

        if ch.auto_remote_tx_stop
            && self
                .rx_watermarks()
                .on_rise(ch.retry_queue.len(), &mut ch.rx_flow_control_auto)
                == Some(Crossing::High)
        {
            info!(
                "Channel {} retry queue at {}, asserting flow control",
                ch.lcid,
                ch.retry_queue.len()
            );
            if ch.update_rx_flow_bit() {
                self.send_status(st, ch);
            }
            self.notify(ch, ChannelEvent::RxRetryHighWatermark);
        }

        if ch.retry_task.is_none() {
            let token = self.inner.shutdown.child_token();
            ch.retry_task = Some(token.clone());
            self.inner
                .runtime
                .spawn(self.clone().run_rx_retry(ch.lcid, token, retry.delay()));
        }
    }

    async fn run_rx_retry(self, lcid: u8, token: CancellationToken, mut delay: Duration) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.retry_head(lcid, &token) {
                Some(next) => delay = next,
                None => break,
            }
        }
        debug!("Channel {} retry task finished", lcid);
    }

    /// Attempt delivery of the head retry record
    ///
    /// Returns the delay before the next attempt, or `None` once the queue
    /// is empty or the task was cancelled.
    fn retry_head(&self, lcid: u8, token: &CancellationToken) -> Option<Duration> {
        let (client, len) = {
            let mut ch = self.inner.channels[lcid as usize].lock();
            if token.is_cancelled() {
                return None;
            }
            let Some(head) = ch.retry_queue.front() else {
                ch.retry_task = None;
                return None;
            };
            (ch.client.clone(), head.packet.payload.len())
        };

        let result = match client {
            Some(client) => client.get_rx_buffer(lcid, len),
            None => Err(RxBufferError::Rejected("channel has no client".into())),
        };

        let (mut st, mut ch) = self.lock(lcid);
        if token.is_cancelled() {
            return None;
        }
        let max = self.inner.config.rx_retry_max();

        let next = match result {
            Ok(Some(buf)) => {
                if let Some(entry) = ch.retry_queue.pop_front() {
                    self.deliver(&ch, buf, &entry.packet.payload);
                }
                Duration::ZERO
            }
            Ok(None) | Err(RxBufferError::TryAgain) => {
                let Some(head) = ch.retry_queue.front_mut() else {
                    ch.retry_task = None;
                    return None;
                };
                match head.retry.next(max) {
                    Some(retry) => {
                        head.retry = retry;
                        debug!(
                            "Channel {} retry {} in {:?}",
                            lcid,
                            retry.attempts(),
                            retry.delay()
                        );
                        return Some(retry.delay());
                    }
                    None => {
                        warn!(
                            "Channel {} abandoning {} byte packet after {} retries",
                            lcid,
                            len,
                            head.retry.attempts() + 1
                        );
                        ch.retry_queue.pop_front();
                        Stats::bump(&self.inner.stats.retry_abandoned);
                        self.notify(&ch, ChannelEvent::ReadFail { len });
                        Duration::ZERO
                    }
                }
            }
            Err(RxBufferError::Rejected(reason)) => {
                warn!("Channel {} client rejected {} bytes: {}", lcid, len, reason);
                ch.retry_queue.pop_front();
                self.notify(&ch, ChannelEvent::ReadFail { len });
                Duration::ZERO
            }
        };

        self.after_retry_dequeue(&mut st, &mut ch);
        if ch.retry_queue.is_empty() {
            ch.retry_task = None;
            return None;
        }
        Some(next)
    }

    fn after_retry_dequeue(&self, st: &mut EngineState, ch: &mut Channel) {
        if self
            .rx_watermarks()
            .on_fall(ch.retry_queue.len(), &mut ch.rx_flow_control_auto)
            == Some(Crossing::Low)
        {
            info!(
                "Channel {} retry queue drained to {}, releasing flow control",
                ch.lcid,
                ch.retry_queue.len()
            );
            if ch.update_rx_flow_bit() {
                self.send_status(st, ch);
            }
            self.notify(ch, ChannelEvent::RxRetryLowWatermark);
        }
    }

    /// Copy `payload` into the client's buffer and raise ReadDone
    pub(crate) fn deliver(&self, ch: &Channel, mut buf: Vec<u8>, payload: &[u8]) {
        buf.clear();
        buf.extend_from_slice(payload);
        self.notify(ch, ChannelEvent::ReadDone { data: buf });
    }
}
