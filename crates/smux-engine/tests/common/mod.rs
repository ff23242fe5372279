//! Shared helpers for engine integration tests

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smux_engine::{
    ChannelClient, ChannelEvent, MuxConfig, MuxEngine, RxBufferError, Transport, TransportError,
};
use smux_protocol::{open_flags, Command, Packet, RxFlag, RxItem, RxParser, WAKEUP_REQ};

// ============================================================================
// Transport
// ============================================================================

/// Transport that records everything written to it
#[derive(Default)]
pub struct MockTransport {
    written: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    pub power_on: AtomicUsize,
    pub power_off: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Take the raw bytes written so far
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.written.lock())
    }

    /// Take and parse the bytes written so far
    pub fn take_items(&self) -> Vec<RxItem> {
        let bytes = self.take();
        let mut parser = RxParser::new();
        parser.feed(&bytes, RxFlag::Normal);
        std::iter::from_fn(|| parser.next_item()).collect()
    }

    /// Take the framed packets written so far, ignoring raw bytes
    pub fn take_packets(&self) -> Vec<Packet> {
        self.take_items()
            .into_iter()
            .filter_map(|item| match item {
                RxItem::Packet(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn power_on_count(&self) -> usize {
        self.power_on.load(Ordering::SeqCst)
    }

    pub fn power_off_count(&self) -> usize {
        self.power_off.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.written.lock().extend_from_slice(data);
        Ok(())
    }

    fn request_power_on(&self) {
        self.power_on.fetch_add(1, Ordering::SeqCst);
    }

    fn request_power_off(&self) {
        self.power_off.fetch_add(1, Ordering::SeqCst);
    }
}

// ============================================================================
// Client
// ============================================================================

/// How a [`RecordingClient`] answers buffer requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxMode {
    Accept,
    TryAgain,
    Reject,
}

/// Client that records every event it is given
pub struct RecordingClient {
    events: Mutex<Vec<ChannelEvent>>,
    mode: Mutex<RxMode>,
    pub buffer_requests: AtomicUsize,
}

impl RecordingClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            mode: Mutex::new(RxMode::Accept),
            buffer_requests: AtomicUsize::new(0),
        })
    }

    pub fn set_mode(&self, mode: RxMode) {
        *self.mode.lock() = mode;
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().clone()
    }

    pub fn take_events(&self) -> Vec<ChannelEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn count(&self, pred: impl Fn(&ChannelEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    /// Payloads of all ReadDone events, in delivery order
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::ReadDone { data } => Some(data.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ChannelClient for RecordingClient {
    fn notify(&self, _lcid: u8, event: ChannelEvent) {
        self.events.lock().push(event);
    }

    fn get_rx_buffer(&self, _lcid: u8, len: usize) -> Result<Option<Vec<u8>>, RxBufferError> {
        self.buffer_requests.fetch_add(1, Ordering::SeqCst);
        match *self.mode.lock() {
            RxMode::Accept => Ok(Some(Vec::with_capacity(len))),
            RxMode::TryAgain => Err(RxBufferError::TryAgain),
            RxMode::Reject => Err(RxBufferError::Rejected("test client".into())),
        }
    }
}

// ============================================================================
// Engine helpers
// ============================================================================

pub fn start(config: MuxConfig) -> (MuxEngine, Arc<MockTransport>) {
    let transport = MockTransport::new();
    let engine = MuxEngine::start(config, transport.clone());
    (engine, transport)
}

/// Let workers run until they go idle
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn frame(cmd: Command, lcid: u8, flags: u8) -> Vec<u8> {
    Packet::new(cmd, lcid, flags).to_bytes().unwrap()
}

pub fn data_frame(lcid: u8, payload: &[u8]) -> Vec<u8> {
    Packet::with_payload(Command::Data, lcid, payload)
        .unwrap()
        .to_bytes()
        .unwrap()
}

/// Have the peer wake the link, then discard the ack
pub async fn wake_by_peer(engine: &MuxEngine, transport: &MockTransport) {
    engine.feed_bytes(&[WAKEUP_REQ], RxFlag::Normal);
    settle().await;
    transport.take();
}

/// Wake the link and fully open `lcid` for `client`
pub async fn open_channel(
    engine: &MuxEngine,
    transport: &MockTransport,
    lcid: u8,
    client: Arc<RecordingClient>,
) {
    wake_by_peer(engine, transport).await;
    engine.open(lcid, client).unwrap();
    engine.feed_bytes(&frame(Command::Open, lcid, 0), RxFlag::Normal);
    engine.feed_bytes(&frame(Command::Open, lcid, open_flags::ACK), RxFlag::Normal);
    settle().await;
    transport.take();
    assert!(engine.channel_state(lcid).unwrap().is_fully_open());
}
