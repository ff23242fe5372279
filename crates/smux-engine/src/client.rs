//! Client capability trait

use thiserror::Error;

use crate::events::ChannelEvent;

/// Why a client could not supply a receive buffer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RxBufferError {
    /// Temporarily out of buffers; the engine queues the packet and retries
    #[error("no buffer available, try again")]
    TryAgain,

    /// Permanent failure; the packet is dropped with a read failure
    #[error("buffer request rejected: {0}")]
    Rejected(String),
}

/// A logical channel's client
///
/// Registered with [`MuxEngine::open`](crate::MuxEngine::open). The engine
/// holds the client until the channel disconnects.
///
/// `notify` is always called from the notification worker, never with an
/// engine lock held, so it may call back into the engine. `get_rx_buffer`
/// runs on the receive path and must not block or feed bytes into the same
/// engine.
pub trait ChannelClient: Send + Sync {
    /// Deliver a channel event
    fn notify(&self, lcid: u8, event: ChannelEvent);

    /// Supply a buffer for an incoming DATA payload of `len` bytes
    ///
    /// `Ok(None)` is treated like [`RxBufferError::TryAgain`].
    fn get_rx_buffer(&self, _lcid: u8, len: usize) -> Result<Option<Vec<u8>>, RxBufferError> {
        Ok(Some(Vec::with_capacity(len)))
    }
}
