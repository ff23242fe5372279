//! Transmit scheduler
//!
//! One worker drains the power queue first, then serves ready channels round
//! robin, one packet per channel per pass. While the link is not on, only
//! local-loopback channels are served and any other work starts the wakeup
//! handshake instead.

use std::time::Duration;

use smux_protocol::{Command, Packet, RxFlag, WAKEUP_REQ};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::channel::TxEntry;
use crate::engine::{EngineState, MuxEngine, WakeTimer};
use crate::error::MuxError;
use crate::events::ChannelEvent;
use crate::flow::{Crossing, RetryState};
use crate::state::{ChannelMode, PowerState, Stats};

/// A packet taken off a queue, ready to be written
pub(crate) enum Outbound {
    Power(Packet),
    Channel {
        entry: TxEntry,
        loopback: bool,
        generation: u64,
    },
}

enum TxStep {
    Send(Outbound),
    PowerOff,
    StartWake,
    ResendWake,
    /// Nothing to do until kicked, or until the wake timer expires
    Wait(Option<Duration>),
}

impl MuxEngine {
    pub(crate) async fn run_tx_worker(self) {
        let shutdown = self.inner.shutdown.clone();
        let inline = self.inner.config.wakeup_inline_threshold();
        debug!("Transmit worker started");

        loop {
            match self.tx_pass() {
                None => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.inner.tx_wakeup.notified() => {}
                },
                Some(delay) if delay < inline => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                },
                Some(delay) => tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.inner.tx_wakeup.notified() => {}
                },
            }
        }
        debug!("Transmit worker stopped");
    }

    /// Send everything currently sendable
    ///
    /// Returns the wake resend delay if a wakeup is outstanding.
    pub(crate) fn tx_pass(&self) -> Option<Duration> {
        loop {
            match self.tx_next() {
                TxStep::Send(out) => self.transmit(out),
                TxStep::PowerOff => {
                    info!("Link powered down");
                    self.inner.transport.request_power_off();
                }
                TxStep::StartWake => {
                    info!("Waking link");
                    self.inner.transport.request_power_on();
                    if let Err(e) = self.send_raw(&[WAKEUP_REQ]) {
                        warn!("Wakeup request not sent: {}", e);
                    }
                }
                TxStep::ResendWake => {
                    if let Err(e) = self.send_raw(&[WAKEUP_REQ]) {
                        warn!("Wakeup request resend failed: {}", e);
                    }
                }
                TxStep::Wait(delay) => return delay,
            }
        }
    }

    fn tx_next(&self) -> TxStep {
        let mut st = self.inner.state.lock();

        if let Some(packet) = st.power_queue.pop_front() {
            self.on_power_packet_sent(&mut st, &packet);
            st.tx_activity = true;
            return TxStep::Send(Outbound::Power(packet));
        }

        let power = st.power;
        match power {
            PowerState::On => {}
            PowerState::OffFlush => {
                // Local loopback work still drains before the clock goes
                if let Some(out) = self.dequeue_channel(&mut st, true) {
                    return TxStep::Send(out);
                }
                st.set_power(PowerState::Off);
                return TxStep::PowerOff;
            }
            _ => {
                if let Some(out) = self.dequeue_channel(&mut st, true) {
                    return TxStep::Send(out);
                }
                return match power {
                    PowerState::Off if !st.ready.is_empty() => {
                        let retry = RetryState::new(self.inner.config.wakeup_delay_min());
                        st.wake = Some(WakeTimer {
                            retry,
                            deadline: Instant::now() + retry.delay(),
                        });
                        st.set_power(PowerState::TurningOn);
                        TxStep::StartWake
                    }
                    PowerState::TurningOn => self.wake_step(&mut st),
                    _ => TxStep::Wait(None),
                };
            }
        }

        match self.dequeue_channel(&mut st, false) {
            Some(out) => TxStep::Send(out),
            None => TxStep::Wait(None),
        }
    }

    fn wake_step(&self, st: &mut EngineState) -> TxStep {
        let max = self.inner.config.wakeup_delay_max();
        let Some(wake) = st.wake.as_mut() else {
            return TxStep::Wait(None);
        };

        let now = Instant::now();
        if now < wake.deadline {
            return TxStep::Wait(Some(wake.deadline - now));
        }
        wake.retry = wake.retry.next_saturating(max);
        wake.deadline = now + wake.retry.delay();
        debug!(
            "Resending wakeup request (attempt {}, next in {:?})",
            wake.retry.attempts(),
            wake.retry.delay()
        );
        TxStep::ResendWake
    }

    /// Take one packet from the next ready channel
    fn dequeue_channel(&self, st: &mut EngineState, loopback_only: bool) -> Option<Outbound> {
        for _ in 0..st.ready.len() {
            let lcid = st.ready.pop_front()?;
            let mut ch = self.inner.channels[lcid as usize].lock();
            let loopback = ch.local_mode == ChannelMode::LocalLoopback;
            if loopback_only && !loopback {
                if !ch.tx_queue.is_empty() {
                    st.ready.push_back(lcid);
                }
                continue;
            }

            let Some(entry) = ch.next_tx() else {
                if !ch.tx_queue.is_empty() {
                    debug!("Channel {} parked with {} queued", lcid, ch.tx_queue.len());
                }
                continue;
            };

            if entry.packet.cmd() == Command::Data && entry.token.is_some() {
                ch.tx_pending_data = ch.tx_pending_data.saturating_sub(1);
                if self.tx_watermarks().on_fall(ch.tx_pending_data, &mut ch.notify_lwm)
                    == Some(Crossing::Low)
                {
                    self.notify(&ch, ChannelEvent::LowWatermark);
                }
            }
            if !ch.tx_queue.is_empty() {
                st.ready.push_back(lcid);
            }
            st.tx_activity = true;
            return Some(Outbound::Channel {
                entry,
                loopback,
                generation: ch.generation,
            });
        }
        None
    }

    fn transmit(&self, out: Outbound) {
        match out {
            Outbound::Power(packet) => {
                if let Err(e) = self.send_packet(&packet, false) {
                    warn!("{} not sent: {}", packet.cmd().name(), e);
                }
            }
            Outbound::Channel {
                entry,
                loopback,
                generation,
            } => {
                let result = self.send_packet(&entry.packet, loopback);
                if let Some(token) = entry.token {
                    let event = match result {
                        Ok(()) => ChannelEvent::WriteDone {
                            token,
                            len: entry.packet.payload.len(),
                        },
                        Err(_) => ChannelEvent::WriteFail { token },
                    };
                    let ch = self.inner.channels[entry.packet.lcid() as usize].lock();
                    if ch.generation != generation {
                        debug!(
                            "Channel {} session ended during write {}, not reporting {}",
                            ch.lcid,
                            token,
                            event.name()
                        );
                        return;
                    }
                    self.notify(&ch, event);
                }
            }
        }
    }

    fn send_packet(&self, packet: &Packet, loopback: bool) -> Result<(), MuxError> {
        let mut buf = Vec::with_capacity(packet.serialized_len());
        if let Err(e) = packet.serialize(&mut buf) {
            error!("Failed to serialize {}: {}", packet.cmd().name(), e);
            return Err(e.into());
        }

        debug!(
            "TX {} lcid={} flags=0x{:02X} len={}{}",
            packet.cmd().name(),
            packet.lcid(),
            packet.flags(),
            packet.payload.len(),
            if loopback { " (local loopback)" } else { "" }
        );
        Stats::bump(&self.inner.stats.packets_sent);

        if loopback {
            self.feed_bytes(&buf, RxFlag::Normal);
            return Ok(());
        }
        self.send_raw(&buf)
    }

    fn send_raw(&self, bytes: &[u8]) -> Result<(), MuxError> {
        if self.inner.config.byte_loopback {
            self.feed_bytes(bytes, RxFlag::Normal);
            return Ok(());
        }

        match self.inner.transport.write_bytes(bytes) {
            Ok(()) => {
                Stats::add(&self.inner.stats.bytes_sent, bytes.len());
                Ok(())
            }
            Err(e) => {
                Stats::bump(&self.inner.stats.transport_errors);
                error!("Transport write of {} bytes failed: {}", bytes.len(), e);
                Err(e.into())
            }
        }
    }
}
