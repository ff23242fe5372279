//! Two engines joined back to back
//!
//! Each direction of the simulated wire is an unbounded byte queue drained
//! by a pump task into the peer's [`MuxEngine::feed_bytes`]. Writes return as
//! soon as the bytes are queued, like a UART with a deep FIFO.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use smux_engine::{MuxConfig, MuxEngine, RxFlag, Transport, TransportError};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Wire behaviour shared by both directions of a pair
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkOptions {
    /// Deliver writes to the peer in pieces of at most this many bytes
    pub chunk_size: Option<usize>,
}

/// One write on the wire
struct WireChunk {
    data: Vec<u8>,
    /// Everything after the first byte arrives with a framing error
    noisy: bool,
}

/// One end of a simulated serial link
pub struct LinkedTransport {
    name: &'static str,
    tx: mpsc::UnboundedSender<WireChunk>,
    connected: AtomicBool,
    corrupt_next: AtomicBool,
    bytes_written: AtomicUsize,
    bytes_dropped: AtomicUsize,
    power_on: AtomicUsize,
    power_off: AtomicUsize,
}

impl LinkedTransport {
    fn new(name: &'static str, tx: mpsc::UnboundedSender<WireChunk>) -> Self {
        Self {
            name,
            tx,
            connected: AtomicBool::new(true),
            corrupt_next: AtomicBool::new(false),
            bytes_written: AtomicUsize::new(0),
            bytes_dropped: AtomicUsize::new(0),
            power_on: AtomicUsize::new(0),
            power_off: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Unplug or replug the cable
    ///
    /// While unplugged, writes still succeed but the bytes never arrive.
    pub fn set_connected(&self, connected: bool) {
        info!(
            "Link {} {}",
            self.name,
            if connected { "connected" } else { "disconnected" }
        );
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Corrupt the next write: the peer sees a framing error after its
    /// first byte
    pub fn inject_line_error(&self) {
        self.corrupt_next.store(true, Ordering::SeqCst);
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written.load(Ordering::SeqCst)
    }

    pub fn bytes_dropped(&self) -> usize {
        self.bytes_dropped.load(Ordering::SeqCst)
    }

    pub fn power_on_count(&self) -> usize {
        self.power_on.load(Ordering::SeqCst)
    }

    pub fn power_off_count(&self) -> usize {
        self.power_off.load(Ordering::SeqCst)
    }
}

impl Transport for LinkedTransport {
    fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError> {
        if !self.is_connected() {
            self.bytes_dropped.fetch_add(data.len(), Ordering::SeqCst);
            debug!("Link {} unplugged, dropped {} bytes", self.name, data.len());
            return Ok(());
        }

        let noisy = self.corrupt_next.swap(false, Ordering::SeqCst);
        self.tx
            .send(WireChunk {
                data: data.to_vec(),
                noisy,
            })
            .map_err(|_| TransportError::Closed)?;
        self.bytes_written.fetch_add(data.len(), Ordering::SeqCst);
        Ok(())
    }

    fn request_power_on(&self) {
        self.power_on.fetch_add(1, Ordering::SeqCst);
    }

    fn request_power_off(&self) {
        self.power_off.fetch_add(1, Ordering::SeqCst);
    }
}

async fn run_pump(
    name: &'static str,
    mut rx: mpsc::UnboundedReceiver<WireChunk>,
    peer: MuxEngine,
    options: LinkOptions,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            chunk = rx.recv() => {
                let Some(chunk) = chunk else { break };
                if chunk.noisy {
                    // First byte arrives clean, the rest with framing errors
                    let mut flags = vec![RxFlag::Frame; chunk.data.len()];
                    if let Some(first) = flags.first_mut() {
                        *first = RxFlag::Normal;
                    }
                    warn!("Link {} corrupting {} byte write", name, chunk.data.len());
                    peer.feed_bytes_flagged(&chunk.data, &flags);
                    continue;
                }
                match options.chunk_size {
                    Some(size) if size > 0 => {
                        for piece in chunk.data.chunks(size) {
                            peer.feed_bytes(piece, RxFlag::Normal);
                        }
                    }
                    _ => peer.feed_bytes(&chunk.data, RxFlag::Normal),
                }
            }
        }
    }
    debug!("Link {} pump stopped", name);
}

/// Two engines talking to each other over a simulated wire
pub struct EnginePair {
    pub a: MuxEngine,
    pub b: MuxEngine,
    /// Transport engine `a` writes through
    pub a_link: Arc<LinkedTransport>,
    /// Transport engine `b` writes through
    pub b_link: Arc<LinkedTransport>,
    shutdown: CancellationToken,
}

impl EnginePair {
    /// Start both engines and their pumps on the current Tokio runtime
    pub fn start(config_a: MuxConfig, config_b: MuxConfig) -> Self {
        Self::start_with(config_a, config_b, LinkOptions::default())
    }

    pub fn start_with(config_a: MuxConfig, config_b: MuxConfig, options: LinkOptions) -> Self {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        let a_link = Arc::new(LinkedTransport::new("a->b", a_tx));
        let b_link = Arc::new(LinkedTransport::new("b->a", b_tx));

        let a = MuxEngine::start(config_a, a_link.clone());
        let b = MuxEngine::start(config_b, b_link.clone());

        let shutdown = CancellationToken::new();
        tokio::spawn(run_pump("a->b", a_rx, b.clone(), options, shutdown.clone()));
        tokio::spawn(run_pump("b->a", b_rx, a.clone(), options, shutdown.clone()));
        info!("Started simulated engine pair");

        Self {
            a,
            b,
            a_link,
            b_link,
            shutdown,
        }
    }

    /// Plug or unplug both directions
    pub fn set_connected(&self, connected: bool) {
        self.a_link.set_connected(connected);
        self.b_link.set_connected(connected);
    }

    /// Reset the transport under both engines
    pub fn reset(&self) {
        warn!("Resetting simulated link");
        self.a.on_transport_reset();
        self.b.on_transport_reset();
    }

    /// Stop both engines and the pumps
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.a.shutdown();
        self.b.shutdown();
        self.shutdown.cancel();
    }
}

impl Drop for EnginePair {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for EnginePair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnginePair")
            .field("a", &self.a)
            .field("b", &self.b)
            .field("connected", &self.a_link.is_connected())
            .finish()
    }
}
