//! Transport that captures the wire instead of sending it

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smux_engine::{Transport, TransportError};
use smux_protocol::{Packet, RxFlag, RxItem, RxParser};
use tracing::debug;

/// Records every byte the engine writes
#[derive(Default)]
pub struct CaptureTransport {
    written: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    power_on: AtomicUsize,
    power_off: AtomicUsize,
}

impl CaptureTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every following write fail until cleared
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Bytes written so far, without consuming them
    pub fn peek(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    /// Take the bytes written so far
    pub fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.written.lock())
    }

    /// Take and decode the bytes written so far
    pub fn take_items(&self) -> Vec<RxItem> {
        let bytes = self.take();
        let mut parser = RxParser::new();
        parser.feed(&bytes, RxFlag::Normal);
        std::iter::from_fn(|| parser.next_item()).collect()
    }

    /// Take the framed packets written so far, skipping raw control bytes
    pub fn take_packets(&self) -> Vec<Packet> {
        self.take_items()
            .into_iter()
            .filter_map(|item| match item {
                RxItem::Packet(packet) => Some(packet),
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

impl Transport for CaptureTransport {
    fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            debug!("Capture transport failing {} byte write", data.len());
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
