//! SMUX Simulation Library
//!
//! This crate exercises SMUX engines without serial hardware. It includes:
//!
//! - **EnginePair**: two engines joined back to back over a simulated wire
//!   that can be unplugged, chunked or corrupted
//! - **CaptureTransport**: a transport that records the wire for inspection
//! - **ScriptedClient**: a channel client with scripted buffer replies and
//!   async waits on its event log
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use smux_engine::MuxConfig;
//! use smux_sim::{EnginePair, ScriptedClient};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let pair = EnginePair::start(MuxConfig::default(), MuxConfig::default());
//! let left = ScriptedClient::new("left");
//! let right = ScriptedClient::new("right");
//!
//! pair.a.open(1, left.clone())?;
//! pair.b.open(1, right.clone())?;
//! left.wait_connected(Duration::from_secs(1)).await?;
//!
//! pair.a.write(1, 1, b"hello")?;
//! let data = right.wait_received(5, Duration::from_secs(1)).await?;
//! assert_eq!(data, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod client;
pub mod error;
pub mod link;

pub use capture::CaptureTransport;
pub use client::{RxReply, ScriptedClient};
pub use error::SimError;
pub use link::{EnginePair, LinkOptions, LinkedTransport};
