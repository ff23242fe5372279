//! Multiplexer engine
//!
//! [`MuxEngine`] owns the channel table, the link power state and the
//! background workers. It is cheap to clone; all clones drive the same
//! engine.
//!
//! # Locking
//!
//! Three lock domains, always taken in this order:
//!
//! 1. the receive parser (held for the whole of [`MuxEngine::feed_bytes`])
//! 2. the engine state (power, power queue, ready list)
//! 3. a single channel
//!
//! No lock is held while writing to the transport or calling into a client's
//! `notify`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use smux_protocol::{open_flags, status_flags, Command, Packet, RxParser, RxState, MAX_PAYLOAD_SIZE};
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::{options, Channel, TxEntry};
use crate::client::ChannelClient;
use crate::config::MuxConfig;
use crate::error::MuxError;
use crate::events::ChannelEvent;
use crate::flow::{Crossing, RetryState, Watermarks};
use crate::notify::{run_notify_worker, Notifier};
use crate::state::{
    ChannelMode, ChannelSnapshot, LocalState, MuxStats, PowerState, RemoteState, Stats,
};
use crate::transport::Transport;

/// Pending wakeup resend
#[derive(Debug, Clone, Copy)]
pub(crate) struct WakeTimer {
    pub retry: RetryState,
    pub deadline: Instant,
}

/// Link-wide state guarded by the engine lock
#[derive(Debug, Default)]
pub(crate) struct EngineState {
    pub power: PowerState,
    /// Power-control packets and raw bytes, sent ahead of channel traffic
    pub power_queue: VecDeque<Packet>,
    /// Channels with sendable packets, in round-robin order
    pub ready: VecDeque<u8>,
    pub powerdown_enabled: bool,
    pub tx_activity: bool,
    pub rx_activity: bool,
    pub wake: Option<WakeTimer>,
}

impl EngineState {
    pub fn enqueue_ready(&mut self, lcid: u8) {
        if !self.ready.contains(&lcid) {
            self.ready.push_back(lcid);
        }
    }

    pub fn set_power(&mut self, power: PowerState) {
        if self.power != power {
            debug!("Power state {:?} -> {:?}", self.power, power);
            self.power = power;
        }
    }
}

pub(crate) struct Inner {
    pub config: MuxConfig,
    pub transport: Arc<dyn Transport>,
    pub runtime: Handle,
    pub parser: Mutex<RxParser>,
    pub state: Mutex<EngineState>,
    pub channels: Box<[Mutex<Channel>]>,
    pub notifier: Notifier,
    pub tx_wakeup: Notify,
    pub shutdown: CancellationToken,
    pub stats: Stats,
}

/// The SMUX multiplexer engine
#[derive(Clone)]
pub struct MuxEngine {
    pub(crate) inner: Arc<Inner>,
}

impl MuxEngine {
    /// Create an engine and start its workers on the current Tokio runtime
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start(config: MuxConfig, transport: Arc<dyn Transport>) -> Self {
        let (notifier, notify_rx) = Notifier::new(config.notify_fifo_size);
        let channels = (0..config.num_channels)
            .map(|lcid| Mutex::new(Channel::new(lcid)))
            .collect();

        info!(
            "Starting SMUX engine: {} channels, power collapse {}",
            config.num_channels,
            if config.power_collapse { "enabled" } else { "disabled" }
        );

        let engine = Self {
            inner: Arc::new(Inner {
                config,
                transport,
                runtime: Handle::current(),
                parser: Mutex::new(RxParser::new()),
                state: Mutex::new(EngineState::default()),
                channels,
                notifier,
                tx_wakeup: Notify::new(),
                shutdown: CancellationToken::new(),
                stats: Stats::default(),
            }),
        };

        let runtime = &engine.inner.runtime;
        runtime.spawn(run_notify_worker(notify_rx, engine.inner.shutdown.clone()));
        runtime.spawn(engine.clone().run_tx_worker());
        runtime.spawn(engine.clone().run_inactivity_timer());
        engine
    }

    /// Stop all workers
    ///
    /// Queued notifications are dropped and nothing further is transmitted.
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("Shutting down SMUX engine");
            self.inner.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn config(&self) -> &MuxConfig {
        &self.inner.config
    }

    pub fn num_channels(&self) -> u8 {
        self.inner.config.num_channels
    }

    // -------------------------------------------------------------------------
    // Channel API
    // -------------------------------------------------------------------------

    /// Open the local half of channel `lcid` for `client`
    ///
    /// Completion is signalled by [`ChannelEvent::Connected`] once the peer
    /// has opened its half as well.
    pub fn open(&self, lcid: u8, client: Arc<dyn ChannelClient>) -> Result<(), MuxError> {
        let (mut st, mut ch) = self.lock_checked(lcid)?;
        match ch.local_state {
            LocalState::Closed => {}
            LocalState::Closing => return Err(MuxError::TryAgain { lcid }),
            LocalState::Opening | LocalState::Opened => return Err(MuxError::AlreadyOpen { lcid }),
        }

        let mut flags = 0;
        if ch.local_mode == ChannelMode::RemoteLoopback {
            flags |= open_flags::REMOTE_LOOPBACK;
        }
        if self.inner.config.power_collapse {
            flags |= open_flags::POWER_COLLAPSE;
        }

        ch.client = Some(client);
        ch.rx_flow_control_auto = false;
        ch.update_rx_flow_bit();
        ch.local_state = LocalState::Opening;
        info!("Opening channel {} (mode {:?})", lcid, ch.local_mode);

        self.queue_packet(&mut st, &mut ch, Packet::new(Command::Open, lcid, flags));
        Ok(())
    }

    /// Close the local half of channel `lcid`
    ///
    /// Closing a channel that is closed or already closing is a no-op.
    /// Queued writes fail with [`ChannelEvent::WriteFail`].
    pub fn close(&self, lcid: u8) -> Result<(), MuxError> {
        let (mut st, mut ch) = self.lock_checked(lcid)?;
        if matches!(ch.local_state, LocalState::Closed | LocalState::Closing) {
            debug!("Channel {} already {:?}", lcid, ch.local_state);
            return Ok(());
        }

        let (failed, open_withdrawn) = ch.purge_tx();
        for token in failed {
            self.notify(&ch, ChannelEvent::WriteFail { token });
        }
        for len in ch.purge_retry() {
            self.notify(&ch, ChannelEvent::ReadFail { len });
        }

        if open_withdrawn {
            info!("Channel {} closed before OPEN was sent", lcid);
            ch.local_state = LocalState::Closed;
            self.notify(&ch, ChannelEvent::LocalClosed);
            self.finish_if_disconnected(&mut ch);
        } else {
            info!("Closing channel {}", lcid);
            ch.local_state = LocalState::Closing;
            self.queue_packet(&mut st, &mut ch, Packet::new(Command::Close, lcid, 0));
        }
        Ok(())
    }

    /// Queue `data` for transmission on channel `lcid`
    ///
    /// `token` is echoed back in the matching [`ChannelEvent::WriteDone`] or
    /// [`ChannelEvent::WriteFail`].
    pub fn write(&self, lcid: u8, token: u64, data: &[u8]) -> Result<(), MuxError> {
        self.check_lcid(lcid)?;
        if data.len() > MAX_PAYLOAD_SIZE {
            return Err(MuxError::PayloadTooLarge {
                len: data.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let (mut st, mut ch) = self.lock(lcid);
        if ch.local_state != LocalState::Opened {
            return Err(MuxError::ChannelNotOpen { lcid });
        }
        if ch.tx_pending_data >= self.inner.config.tx_wm_high {
            return Err(MuxError::WouldOverflow {
                lcid,
                pending: ch.tx_pending_data,
            });
        }

        let packet = Packet::with_payload(Command::Data, lcid, data)?;
        ch.tx_queue.push_back(TxEntry {
            packet,
            token: Some(token),
        });
        ch.tx_pending_data += 1;
        if self.tx_watermarks().on_rise(ch.tx_pending_data, &mut ch.notify_lwm)
            == Some(Crossing::High)
        {
            self.notify(&ch, ChannelEvent::HighWatermark);
        }

        st.enqueue_ready(lcid);
        self.kick();
        Ok(())
    }

    /// Set and clear channel option bits (see [`options`])
    ///
    /// The loopback modes are exclusive; setting one replaces the other.
    pub fn set_option(&self, lcid: u8, set: u32, clear: u32) -> Result<(), MuxError> {
        let (mut st, mut ch) = self.lock_checked(lcid)?;

        if set & options::LOCAL_LOOPBACK != 0 {
            ch.local_mode = ChannelMode::LocalLoopback;
        } else if clear & options::LOCAL_LOOPBACK != 0 && ch.local_mode == ChannelMode::LocalLoopback
        {
            ch.local_mode = ChannelMode::Normal;
        }

        if set & options::REMOTE_LOOPBACK != 0 {
            ch.local_mode = ChannelMode::RemoteLoopback;
        } else if clear & options::REMOTE_LOOPBACK != 0
            && ch.local_mode == ChannelMode::RemoteLoopback
        {
            ch.local_mode = ChannelMode::Normal;
        }

        if set & options::REMOTE_TX_STOP != 0 {
            ch.rx_flow_control_client = true;
        } else if clear & options::REMOTE_TX_STOP != 0 {
            ch.rx_flow_control_client = false;
        }

        if set & options::AUTO_REMOTE_TX_STOP != 0 {
            ch.auto_remote_tx_stop = true;
        } else if clear & options::AUTO_REMOTE_TX_STOP != 0 {
            ch.auto_remote_tx_stop = false;
            ch.rx_flow_control_auto = false;
        }

        debug!("Channel {} options set 0x{:X} clear 0x{:X}", lcid, set, clear);
        if ch.update_rx_flow_bit() {
            self.send_status(&mut st, &mut ch);
        }
        Ok(())
    }

    /// TIOCM view of channel `lcid`
    pub fn tiocm_get(&self, lcid: u8) -> Result<u32, MuxError> {
        self.check_lcid(lcid)?;
        Ok(self.inner.channels[lcid as usize].lock().tiocm())
    }

    /// Set and clear the local DTR/RTS bits, notifying the peer on change
    pub fn tiocm_set(&self, lcid: u8, set: u32, clear: u32) -> Result<(), MuxError> {
        let (mut st, mut ch) = self.lock_checked(lcid)?;
        if ch.apply_tiocm(set, clear) {
            self.send_status(&mut st, &mut ch);
        }
        Ok(())
    }

    /// Pending transmit data is at the high watermark
    pub fn is_channel_full(&self, lcid: u8) -> bool {
        self.channel(lcid)
            .map(|ch| ch.lock().tx_pending_data >= self.inner.config.tx_wm_high)
            .unwrap_or(false)
    }

    /// Pending transmit data is at or below the low watermark
    pub fn is_channel_low(&self, lcid: u8) -> bool {
        self.channel(lcid)
            .map(|ch| ch.lock().tx_pending_data <= self.inner.config.tx_wm_low)
            .unwrap_or(false)
    }

    // -------------------------------------------------------------------------
    // Transport hooks
    // -------------------------------------------------------------------------

    /// Tear down all link state after the transport was reset
    ///
    /// Every channel is closed, queued writes fail, the parser returns to
    /// IDLE and the link is considered powered off. All notifications are
    /// queued before this returns.
    pub fn on_transport_reset(&self) {
        let inner = &self.inner;
        let mut parser = inner.parser.lock();
        parser.reset();

        let mut st = inner.state.lock();
        warn!("Transport reset, purging link state");
        let was_powered = st.power != PowerState::Off;
        st.set_power(PowerState::Off);
        st.power_queue.clear();
        st.ready.clear();
        st.powerdown_enabled = false;
        st.tx_activity = false;
        st.rx_activity = false;
        st.wake = None;

        for slot in inner.channels.iter() {
            let mut ch = slot.lock();
            for len in ch.purge_retry() {
                self.notify(&ch, ChannelEvent::ReadFail { len });
            }
            for token in ch.clear_tx() {
                self.notify(&ch, ChannelEvent::WriteFail { token });
            }

            let was_open =
                ch.local_state != LocalState::Closed || ch.remote_state != RemoteState::Closed;
            ch.local_state = LocalState::Closed;
            ch.remote_state = RemoteState::Closed;
            ch.end_session();

            if was_open {
                info!("Channel {} closed by transport reset", ch.lcid);
                self.notify(
                    &ch,
                    ChannelEvent::Disconnected {
                        transport_reset: true,
                    },
                );
            }
            ch.client = None;
        }
        drop(st);
        drop(parser);

        if was_powered {
            inner.transport.request_power_off();
        }
    }

    // -------------------------------------------------------------------------
    // Introspection
    // -------------------------------------------------------------------------

    /// Snapshot of channel `lcid`
    pub fn channel_state(&self, lcid: u8) -> Result<ChannelSnapshot, MuxError> {
        Ok(self.channel(lcid)?.lock().snapshot())
    }

    pub fn power_state(&self) -> PowerState {
        self.inner.state.lock().power
    }

    pub fn parser_state(&self) -> RxState {
        self.inner.parser.lock().state()
    }

    pub fn stats(&self) -> MuxStats {
        self.inner.stats.snapshot()
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    fn check_lcid(&self, lcid: u8) -> Result<(), MuxError> {
        if (lcid as usize) < self.inner.channels.len() {
            Ok(())
        } else {
            Err(MuxError::InvalidChannel(lcid))
        }
    }

    fn channel(&self, lcid: u8) -> Result<&Mutex<Channel>, MuxError> {
        self.inner
            .channels
            .get(lcid as usize)
            .ok_or(MuxError::InvalidChannel(lcid))
    }

    /// Lock the engine state and channel `lcid`, which must be valid
    pub(crate) fn lock(&self, lcid: u8) -> (MutexGuard<'_, EngineState>, MutexGuard<'_, Channel>) {
        let st = self.inner.state.lock();
        let ch = self.inner.channels[lcid as usize].lock();
        (st, ch)
    }

    fn lock_checked(
        &self,
        lcid: u8,
    ) -> Result<(MutexGuard<'_, EngineState>, MutexGuard<'_, Channel>), MuxError> {
        self.check_lcid(lcid)?;
        Ok(self.lock(lcid))
    }

    pub(crate) fn kick(&self) {
        self.inner.tx_wakeup.notify_one();
    }

    pub(crate) fn notify(&self, ch: &Channel, event: ChannelEvent) {
        self.inner.notifier.notify(ch, event, &self.inner.stats);
    }

    pub(crate) fn tx_watermarks(&self) -> Watermarks {
        Watermarks::new(self.inner.config.tx_wm_low, self.inner.config.tx_wm_high)
    }

    pub(crate) fn rx_watermarks(&self) -> Watermarks {
        Watermarks::new(self.inner.config.rx_wm_low, self.inner.config.rx_wm_high)
    }

    /// Append a packet to the channel's transmit queue
    pub(crate) fn queue_packet(&self, st: &mut EngineState, ch: &mut Channel, packet: Packet) {
        ch.tx_queue.push_back(TxEntry {
            packet,
            token: None,
        });
        st.enqueue_ready(ch.lcid);
        self.kick();
    }

    /// Push the local status bits to the peer
    pub(crate) fn send_status(&self, st: &mut EngineState, ch: &mut Channel) {
        if ch.local_state != LocalState::Opened {
            return;
        }
        debug!(
            "Channel {} sending status 0x{:02X}{}",
            ch.lcid,
            ch.local_status,
            if ch.local_status & status_flags::FLOW_CONTROL != 0 {
                " (flow control)"
            } else {
                ""
            }
        );
        let packet = Packet::new(Command::Status, ch.lcid, ch.local_status);
        self.queue_packet(st, ch, packet);
    }

    /// Both halves just became open
    pub(crate) fn on_connected(&self, st: &mut EngineState, ch: &mut Channel) {
        info!("Channel {} connected", ch.lcid);
        self.notify(ch, ChannelEvent::Connected);
        if !ch.tx_queue.is_empty() {
            st.enqueue_ready(ch.lcid);
            self.kick();
        }
    }

    /// Raise Disconnected and release the client once both halves are closed
    pub(crate) fn finish_if_disconnected(&self, ch: &mut Channel) {
        if ch.local_state != LocalState::Closed || ch.remote_state != RemoteState::Closed {
            return;
        }
        info!("Channel {} disconnected", ch.lcid);
        for len in ch.purge_retry() {
            self.notify(ch, ChannelEvent::ReadFail { len });
        }
        self.notify(
            ch,
            ChannelEvent::Disconnected {
                transport_reset: false,
            },
        );
        ch.end_session();
        ch.client = None;
    }
}

impl std::fmt::Debug for MuxEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxEngine")
            .field("channels", &self.inner.channels.len())
            .field("power", &self.power_state())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}
