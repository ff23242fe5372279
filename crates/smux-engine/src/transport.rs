//! Physical transport collaborator
//!
//! The engine writes through a [`Transport`] and receives through
//! [`MuxEngine::feed_bytes`]. [`SerialTransport`] binds both directions to a
//! serial port.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use parking_lot::Mutex;
use serialport::SerialPort;
use smux_protocol::RxFlag;
use tracing::{debug, error, info, warn};

use crate::engine::MuxEngine;
use crate::error::TransportError;

/// Attempts for a write that makes no progress before giving up
const WRITE_RETRIES: usize = 3;

/// Byte sink and power control for the physical link
pub trait Transport: Send + Sync {
    /// Write all of `data`, blocking until accepted
    fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Take a clock/power vote on the link
    fn request_power_on(&self) {}

    /// Release the clock/power vote on the link
    fn request_power_off(&self) {}
}

/// Transport over a serial port
pub struct SerialTransport {
    port_name: String,
    port: Mutex<Box<dyn SerialPort>>,
}

impl SerialTransport {
    /// Open `path` at `baud_rate`
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()?;
        info!("Opened serial transport {} at {} baud", path, baud_rate);
        Ok(Self {
            port_name: path.to_string(),
            port: Mutex::new(port),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Start a reader thread feeding received bytes into `engine`
    ///
    /// The thread exits when the engine shuts down or the port fails; a
    /// port failure is reported to the engine as a transport reset.
    pub fn spawn_reader(
        &self,
        engine: MuxEngine,
    ) -> Result<std::thread::JoinHandle<()>, TransportError> {
        let mut reader = self.port.lock().try_clone()?;
        let port_name = self.port_name.clone();

        let handle = std::thread::Builder::new()
            .name(format!("smux-rx-{}", port_name))
            .spawn(move || {
                let mut buffer = [0u8; 1024];
                info!("Starting read loop on {}", port_name);
                while !engine.is_shut_down() {
                    match reader.read(&mut buffer) {
                        Ok(0) => {}
                        Ok(n) => {
                            debug!("Read {} bytes from {}: {:02X?}", n, port_name, &buffer[..n]);
                            engine.feed_bytes(&buffer[..n], RxFlag::Normal);
                        }
                        Err(e) if e.kind() == ErrorKind::TimedOut => {}
                        Err(e) if e.kind() == ErrorKind::Interrupted => {}
                        Err(e) => {
                            error!("Read error on {}: {}", port_name, e);
                            engine.on_transport_reset();
                            break;
                        }
                    }
                }
                info!("Read loop ended on {}", port_name);
            })?;
        Ok(handle)
    }
}

impl Transport for SerialTransport {
    fn write_bytes(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut port = self.port.lock();
        let mut written = 0;
        let mut stalls = 0;

        while written < data.len() {
            match port.write(&data[written..]) {
                Ok(0) => stalls += 1,
                Ok(n) => written += n,
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => {
                    warn!("Write to {} stalled: {}", self.port_name, e);
                    stalls += 1;
                }
                Err(e) => return Err(e.into()),
            }
            if stalls >= WRITE_RETRIES {
                return Err(TransportError::ShortWrite {
                    written,
                    len: data.len(),
                });
            }
        }
        port.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port_name", &self.port_name)
            .finish_non_exhaustive()
    }
}
