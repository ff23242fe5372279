//! Receive path: parser output dispatch and the channel state machine

use smux_protocol::{
    close_flags, open_flags, status_flags, Command, Packet, RxFlag, RxItem, RxParser,
};
use tracing::{debug, error, info, warn};

use crate::client::RxBufferError;
use crate::engine::MuxEngine;
use crate::events::ChannelEvent;
use crate::state::{ChannelMode, LocalState, RemoteState, Stats};

impl MuxEngine {
    /// Entry point for bytes received from the transport
    ///
    /// `flag` reports a reception error for every byte of the chunk. Bytes
    /// may be split across calls at any position.
    pub fn feed_bytes(&self, data: &[u8], flag: RxFlag) {
        self.receive(data.len(), |parser| parser.feed(data, flag));
    }

    /// Like [`MuxEngine::feed_bytes`], with one reception flag per byte
    ///
    /// Bytes beyond the end of `flags` count as [`RxFlag::Normal`].
    pub fn feed_bytes_flagged(&self, data: &[u8], flags: &[RxFlag]) {
        self.receive(data.len(), |parser| parser.feed_flagged(data, flags));
    }

    fn receive(&self, len: usize, feed: impl FnOnce(&mut RxParser)) {
        if len == 0 {
            return;
        }
        self.inner.state.lock().rx_activity = true;
        Stats::add(&self.inner.stats.bytes_received, len);

        let mut parser = self.inner.parser.lock();
        let was_failed = parser.is_failed();
        feed(&mut *parser);
        if parser.is_failed() && !was_failed {
            Stats::bump(&self.inner.stats.parser_failures);
            error!("Receive parser failed on a line error, waiting for transport reset");
        }

        while let Some(item) = parser.next_item() {
            match item {
                RxItem::Packet(packet) => self.dispatch_packet(packet),
                RxItem::WakeupRequest => self.handle_wakeup_request(),
                RxItem::WakeupAck => self.handle_wakeup_ack(),
                RxItem::EchoRequest => self.handle_echo_request(),
                RxItem::EchoAck { ok } => self.handle_echo_ack(ok),
            }
        }
    }

    fn dispatch_packet(&self, packet: Packet) {
        Stats::bump(&self.inner.stats.packets_received);
        let cmd = packet.cmd();
        let lcid = packet.lcid();
        debug!(
            "RX {} lcid={} flags=0x{:02X} len={}",
            cmd.name(),
            lcid,
            packet.flags(),
            packet.payload.len()
        );

        if matches!(cmd, Command::PowerControl | Command::Delay | Command::Byte) {
            match cmd {
                Command::PowerControl => self.handle_power_control(packet.flags()),
                Command::Delay => debug!("Ignoring DELAY request"),
                _ => warn!("Unexpected {} packet from parser", cmd.name()),
            }
            return;
        }

        if lcid as usize >= self.inner.channels.len() {
            warn!("{} for invalid channel {}, dropping", cmd.name(), lcid);
            return;
        }

        match cmd {
            Command::Data => self.handle_data(packet),
            Command::Open => self.handle_open(lcid, packet.flags()),
            Command::Close => self.handle_close(lcid, packet.flags()),
            Command::Status => self.handle_status(lcid, packet.flags()),
            _ => {}
        }
    }

    fn handle_open(&self, lcid: u8, flags: u8) {
        let power_collapse =
            flags & open_flags::POWER_COLLAPSE != 0 && self.inner.config.power_collapse;
        let (mut st, mut ch) = self.lock(lcid);

        if flags & open_flags::ACK != 0 {
            let local = ch.local_state;
            match local {
                LocalState::Opening => {
                    info!("Channel {} open acknowledged", lcid);
                    ch.local_state = LocalState::Opened;
                    if ch.local_status != 0 {
                        // Status set while closed has not reached the peer yet
                        self.send_status(&mut st, &mut ch);
                    }
                    if power_collapse {
                        self.enable_powerdown(&mut st);
                    }
                    if ch.remote_state == RemoteState::Opened {
                        self.on_connected(&mut st, &mut ch);
                    }
                }
                _ if ch.remote_mode == ChannelMode::RemoteLoopback => {
                    debug!("Channel {} loopback OPEN echo acknowledged", lcid);
                }
                LocalState::Closing => {
                    debug!("Channel {} open ack arrived while closing", lcid);
                }
                state => warn!("Channel {} unexpected OPEN ACK in {:?}", lcid, state),
            }
            return;
        }

        if ch.remote_state != RemoteState::Closed {
            warn!("Channel {} OPEN while remote already open, ignoring", lcid);
            return;
        }

        ch.remote_state = RemoteState::Opened;
        let mut ack = open_flags::ACK;
        if power_collapse {
            ack |= open_flags::POWER_COLLAPSE;
            self.enable_powerdown(&mut st);
        }

        if flags & open_flags::REMOTE_LOOPBACK != 0 {
            info!("Channel {} opened by peer in remote loopback", lcid);
            ch.remote_mode = ChannelMode::RemoteLoopback;
            ack |= open_flags::REMOTE_LOOPBACK;
            self.queue_packet(&mut st, &mut ch, Packet::new(Command::Open, lcid, ack));
            self.queue_packet(&mut st, &mut ch, Packet::new(Command::Open, lcid, 0));
        } else {
            info!("Channel {} opened by peer", lcid);
            ch.remote_mode = ChannelMode::Normal;
            self.queue_packet(&mut st, &mut ch, Packet::new(Command::Open, lcid, ack));
        }

        if ch.local_state == LocalState::Opened {
            self.on_connected(&mut st, &mut ch);
        }
    }

    fn handle_close(&self, lcid: u8, flags: u8) {
        let (mut st, mut ch) = self.lock(lcid);

        if flags & close_flags::ACK != 0 {
            let local = ch.local_state;
            match local {
                LocalState::Closing => {
                    info!("Channel {} close acknowledged", lcid);
                    ch.local_state = LocalState::Closed;
                    self.notify(&ch, ChannelEvent::LocalClosed);
                    self.finish_if_disconnected(&mut ch);
                }
                LocalState::Closed => debug!("Channel {} stale CLOSE ACK", lcid),
                state => warn!("Channel {} unexpected CLOSE ACK in {:?}", lcid, state),
            }
            return;
        }

        if ch.remote_state != RemoteState::Opened {
            warn!("Channel {} CLOSE while remote not open, ignoring", lcid);
            return;
        }

        info!("Channel {} closed by peer", lcid);
        ch.remote_state = RemoteState::Closed;
        self.queue_packet(
            &mut st,
            &mut ch,
            Packet::new(Command::Close, lcid, close_flags::ACK),
        );
        if ch.remote_mode == ChannelMode::RemoteLoopback {
            ch.remote_mode = ChannelMode::Normal;
            self.queue_packet(&mut st, &mut ch, Packet::new(Command::Close, lcid, 0));
        }

        for len in ch.purge_retry() {
            self.notify(&ch, ChannelEvent::ReadFail { len });
        }
        self.notify(&ch, ChannelEvent::RemoteClosed);
        self.finish_if_disconnected(&mut ch);
    }

    fn handle_status(&self, lcid: u8, flags: u8) {
        let (mut st, mut ch) = self.lock(lcid);
        if ch.remote_status == flags {
            return;
        }

        let old = ch.tiocm();
        ch.remote_status = flags;

        let flow = flags & status_flags::FLOW_CONTROL != 0;
        if flow != ch.tx_flow_control {
            ch.tx_flow_control = flow;
            if flow {
                info!("Channel {} peer asserted flow control", lcid);
            } else {
                info!("Channel {} peer released flow control", lcid);
                if !ch.tx_queue.is_empty() {
                    st.enqueue_ready(lcid);
                    self.kick();
                }
            }
        }

        let new = ch.tiocm();
        if new != old {
            self.notify(&ch, ChannelEvent::TiocmUpdate { old, new });
        }
    }

    fn handle_data(&self, packet: Packet) {
        let lcid = packet.lcid();
        let len = packet.payload.len();

        let client = {
            let (mut st, mut ch) = self.lock(lcid);
            if ch.remote_mode == ChannelMode::RemoteLoopback {
                debug!("Channel {} echoing {} bytes", lcid, len);
                self.queue_packet(&mut st, &mut ch, packet);
                return;
            }
            if !ch.is_fully_open() {
                warn!(
                    "Channel {} DATA while not fully open, dropping {} bytes",
                    lcid, len
                );
                return;
            }
            if !ch.retry_queue.is_empty() {
                self.queue_retry(&mut st, &mut ch, packet);
                return;
            }
            ch.client.clone()
        };

        let result = match client {
            Some(client) => client.get_rx_buffer(lcid, len),
            None => Err(RxBufferError::Rejected("channel has no client".into())),
        };

        let (mut st, mut ch) = self.lock(lcid);
        match result {
            Ok(Some(buf)) => self.deliver(&ch, buf, &packet.payload),
            Ok(None) | Err(RxBufferError::TryAgain) => {
                if ch.is_fully_open() {
                    self.queue_retry(&mut st, &mut ch, packet);
                } else {
                    self.notify(&ch, ChannelEvent::ReadFail { len });
                }
            }
            Err(RxBufferError::Rejected(reason)) => {
                warn!("Channel {} client rejected {} bytes: {}", lcid, len, reason);
                self.notify(&ch, ChannelEvent::ReadFail { len });
            }
        }
    }
}
