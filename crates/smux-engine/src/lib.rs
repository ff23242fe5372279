//! SMUX Multiplexer Engine
//!
//! This crate multiplexes many logical channels over a single serial byte
//! stream using the SMUX protocol from [`smux_protocol`].
//!
//! # Architecture
//!
//! A [`MuxEngine`] sits between channel clients and one physical
//! [`Transport`]:
//!
//! - **Receive path**: transport bytes enter through
//!   [`MuxEngine::feed_bytes`], are framed by the parser and dispatched to
//!   the channel and power state machines
//! - **Transmit path**: client writes are queued per channel and drained
//!   round robin by a transmit worker, behind any power-control traffic
//! - **Power management**: the link sleeps after an idle period when both
//!   sides support power collapse, and is woken on demand with a
//!   request/ack handshake
//! - **Notifications**: every client-visible change is delivered as a
//!   [`ChannelEvent`] from a worker that holds no engine locks
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use smux_engine::{ChannelClient, ChannelEvent, MuxConfig, MuxEngine, SerialTransport};
//!
//! struct Printer;
//!
//! impl ChannelClient for Printer {
//!     fn notify(&self, lcid: u8, event: ChannelEvent) {
//!         println!("channel {}: {:?}", lcid, event);
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(SerialTransport::open("/dev/ttyUSB0", 115_200)?);
//! let engine = MuxEngine::start(MuxConfig::default(), transport.clone());
//! transport.spawn_reader(engine.clone())?;
//!
//! engine.open(5, Arc::new(Printer))?;
//! // After ChannelEvent::Connected:
//! engine.write(5, 1, b"hello")?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod flow;
mod notify;
mod power;
mod retry;
mod rx;
pub mod state;
pub mod transport;
mod tx;

pub use channel::options;
pub use client::{ChannelClient, RxBufferError};
pub use config::MuxConfig;
pub use engine::MuxEngine;
pub use error::{ErrorKind, MuxError, TransportError};
pub use events::ChannelEvent;
pub use flow::{Crossing, RetryState, Watermarks};
pub use state::{ChannelMode, ChannelSnapshot, LocalState, MuxStats, PowerState, RemoteState};
pub use transport::{SerialTransport, Transport};

// Wire-level types callers need alongside the engine
pub use smux_protocol::{tiocm, RxFlag, RxState};
