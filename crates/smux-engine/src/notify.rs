//! Notification FIFO and delivery worker

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::channel::Channel;
use crate::client::ChannelClient;
use crate::events::ChannelEvent;
use crate::state::Stats;

pub(crate) struct Notification {
    lcid: u8,
    client: Arc<dyn ChannelClient>,
    event: ChannelEvent,
}

/// Producer side of the bounded notification FIFO
///
/// Never blocks: a full FIFO drops the event.
pub(crate) struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue `event` for the channel's client, if it has one
    pub fn notify(&self, ch: &Channel, event: ChannelEvent, stats: &Stats) {
        let Some(client) = ch.client.clone() else {
            debug!("No client on channel {}, dropping {}", ch.lcid, event.name());
            return;
        };
        debug!("Channel {}: {}", ch.lcid, event.name());
        let notification = Notification {
            lcid: ch.lcid,
            client,
            event,
        };
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                Stats::bump(&stats.dropped_notifications);
                error!(
                    "Notification FIFO full, dropping {} for channel {}",
                    n.event.name(),
                    n.lcid
                );
            }
            Err(TrySendError::Closed(n)) => {
                debug!(
                    "Notification worker stopped, dropping {} for channel {}",
                    n.event.name(),
                    n.lcid
                );
            }
        }
    }
}

/// Deliver queued notifications in order until shutdown
pub(crate) async fn run_notify_worker(
    mut rx: mpsc::Receiver<Notification>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            n = rx.recv() => {
                let Some(n) = n else { break };
                n.client.notify(n.lcid, n.event);
            }

            _ = shutdown.cancelled() => break,
        }
    }
    debug!("Notification worker stopped");
}
