//! Link power state machine
//!
//! Sleep is negotiated with a POWER_CONTROL request/ack exchange once the
//! link has been idle for a full inactivity period. Wakeup uses the raw
//! `WAKEUP_REQ`/`WAKEUP_ACK` bytes, driven from the transmit worker.

use smux_protocol::{power_flags, Command, Packet, ECHO_ACK_OK, WAKEUP_ACK};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::engine::{EngineState, MuxEngine};
use crate::state::{PowerState, Stats};

impl MuxEngine {
    pub(crate) async fn run_inactivity_timer(self) {
        let shutdown = self.inner.shutdown.clone();
        let mut interval = tokio::time::interval(self.inner.config.inactivity_timeout());
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.check_inactivity(),
            }
        }
        debug!("Inactivity timer stopped");
    }

    fn check_inactivity(&self) {
        let mut st = self.inner.state.lock();
        if st.tx_activity || st.rx_activity {
            st.tx_activity = false;
            st.rx_activity = false;
            return;
        }
        if st.power != PowerState::On || !st.powerdown_enabled {
            return;
        }
        if !st.power_queue.is_empty() || !st.ready.is_empty() {
            return;
        }

        info!(
            "Link idle for {:?}, requesting sleep",
            self.inner.config.inactivity_timeout()
        );
        st.power_queue.push_back(Packet::power_control(false));
        st.set_power(PowerState::TurningOffFlush);
        self.kick();
    }

    /// Allow the link to sleep once idle
    pub(crate) fn enable_powerdown(&self, st: &mut EngineState) {
        if !st.powerdown_enabled {
            info!("Power collapse negotiated with peer");
            st.powerdown_enabled = true;
        }
    }

    /// Advance the power state as a power-queue packet leaves
    pub(crate) fn on_power_packet_sent(&self, st: &mut EngineState, packet: &Packet) {
        if packet.cmd() != Command::PowerControl || st.power != PowerState::TurningOffFlush {
            return;
        }
        if packet.has_flags(power_flags::ACK) {
            st.set_power(PowerState::OffFlush);
        } else {
            st.set_power(PowerState::TurningOff);
        }
    }

    pub(crate) fn handle_power_control(&self, flags: u8) {
        let mut st = self.inner.state.lock();

        if flags & power_flags::ACK != 0 {
            if st.power == PowerState::TurningOff {
                info!("Peer acknowledged sleep");
                st.set_power(PowerState::OffFlush);
                self.kick();
            } else {
                warn!("Unexpected sleep ack in power state {:?}", st.power);
            }
            return;
        }

        let power = st.power;
        match power {
            PowerState::On => {
                info!("Peer requested sleep");
                st.power_queue.push_back(Packet::power_control(true));
                st.set_power(PowerState::TurningOffFlush);
                self.kick();
            }
            PowerState::TurningOffFlush | PowerState::TurningOff => {
                info!("Sleep requests crossed, powering down");
                st.set_power(PowerState::OffFlush);
                self.kick();
            }
            _ => warn!("Ignoring sleep request in power state {:?}", power),
        }
    }

    pub(crate) fn handle_wakeup_request(&self) {
        let mut st = self.inner.state.lock();
        let power = st.power;
        match power {
            PowerState::Off | PowerState::TurningOn => {
                let was_off = power == PowerState::Off;
                info!("Woken by peer");
                st.set_power(PowerState::On);
                st.wake = None;
                st.rx_activity = true;
                st.power_queue.push_back(Packet::byte(WAKEUP_ACK));
                Stats::bump(&self.inner.stats.remote_wakeups);
                drop(st);

                if was_off {
                    self.inner.transport.request_power_on();
                }
                self.kick();
            }
            PowerState::On => {
                debug!("Wakeup request while on, acking again");
                st.power_queue.push_back(Packet::byte(WAKEUP_ACK));
                self.kick();
            }
            _ => warn!("Ignoring wakeup request in power state {:?}", power),
        }
    }

    pub(crate) fn handle_wakeup_ack(&self) {
        let mut st = self.inner.state.lock();
        if st.power != PowerState::TurningOn {
            debug!("Stale wakeup ack in power state {:?}", st.power);
            return;
        }

        let attempts = st.wake.take().map(|w| w.retry.attempts() + 1).unwrap_or(1);
        info!("Link awake after {} wakeup request(s)", attempts);
        st.set_power(PowerState::On);
        st.rx_activity = true;
        Stats::bump(&self.inner.stats.local_wakeups);
        self.kick();
    }

    /// Byte-loopback test mode: answer an echo request while the link is on
    pub(crate) fn handle_echo_request(&self) {
        let mut st = self.inner.state.lock();
        if st.power != PowerState::On {
            debug!("Ignoring echo request in power state {:?}", st.power);
            return;
        }
        debug!("Answering echo request");
        st.power_queue.push_back(Packet::byte(ECHO_ACK_OK));
        self.kick();
    }

    pub(crate) fn handle_echo_ack(&self, ok: bool) {
        if ok {
            info!("Peer answered echo request");
        } else {
            warn!("Peer reported echo failure");
        }
    }
}
