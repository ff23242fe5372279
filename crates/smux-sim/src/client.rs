//! Scriptable channel client
//!
//! Records every event, answers buffer requests from a script, and lets
//! async tests wait for an event to show up.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smux_engine::{ChannelClient, ChannelEvent, RxBufferError};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::SimError;

/// Answer to one receive buffer request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxReply {
    Accept,
    TryAgain,
    Reject,
}

/// Channel client driven by a test script
pub struct ScriptedClient {
    name: String,
    log: Mutex<Vec<ChannelEvent>>,
    changed: Notify,
    script: Mutex<VecDeque<RxReply>>,
    fallback: Mutex<RxReply>,
    buffer_requests: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            log: Mutex::new(Vec::new()),
            changed: Notify::new(),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(RxReply::Accept),
            buffer_requests: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue replies for the next buffer requests
    pub fn script_rx(&self, replies: impl IntoIterator<Item = RxReply>) {
        self.script.lock().extend(replies);
    }

    /// Reply used once the script runs out
    pub fn set_fallback(&self, reply: RxReply) {
        *self.fallback.lock() = reply;
    }

    pub fn buffer_requests(&self) -> usize {
        self.buffer_requests.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.log.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&ChannelEvent) -> bool) -> usize {
        self.log.lock().iter().filter(|e| pred(e)).count()
    }

    /// Concatenation of every payload delivered so far
    pub fn received(&self) -> Vec<u8> {
        self.log
            .lock()
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::ReadDone { data } => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Wait until `check` finds what it wants in the event log
    pub async fn wait_until<T>(
        &self,
        what: &str,
        timeout: Duration,
        check: impl Fn(&[ChannelEvent]) -> Option<T>,
    ) -> Result<T, SimError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let found = check(self.log.lock().as_slice());
            if let Some(found) = found {
                return Ok(found);
            }
            wait_or_timeout(notified, deadline, || SimError::Timeout {
                client: self.name.clone(),
                what: what.to_string(),
                after: timeout,
            })
            .await?;
        }
    }

    /// Wait for the `n`th event matching `pred`
    pub async fn wait_for_count(
        &self,
        what: &str,
        n: usize,
        timeout: Duration,
        pred: impl Fn(&ChannelEvent) -> bool,
    ) -> Result<(), SimError> {
        self.wait_until(what, timeout, |log| {
            (log.iter().filter(|e| pred(e)).count() >= n).then_some(())
        })
        .await
    }

    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), SimError> {
        self.wait_for_count("Connected", 1, timeout, |e| {
            matches!(e, ChannelEvent::Connected)
        })
        .await
    }

    pub async fn wait_disconnected(&self, timeout: Duration) -> Result<ChannelEvent, SimError> {
        self.wait_until("Disconnected", timeout, |log| {
            log.iter()
                .find(|e| matches!(e, ChannelEvent::Disconnected { .. }))
                .cloned()
        })
        .await
    }

    /// Wait until at least `len` payload bytes have arrived
    pub async fn wait_received(&self, len: usize, timeout: Duration) -> Result<Vec<u8>, SimError> {
        let what = format!("{} received bytes", len);
        self.wait_until(&what, timeout, |log| {
            let total: usize = log
                .iter()
                .map(|e| match e {
                    ChannelEvent::ReadDone { data } => data.len(),
                    _ => 0,
                })
                .sum();
            (total >= len).then_some(())
        })
        .await?;
        Ok(self.received())
    }
}

async fn wait_or_timeout<F: Future>(
    fut: F,
    deadline: Instant,
    err: impl FnOnce() -> SimError,
) -> Result<(), SimError> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(_) => Ok(()),
        Err(_) => Err(err()),
    }
}

impl ChannelClient for ScriptedClient {
    fn notify(&self, lcid: u8, event: ChannelEvent) {
        debug!("Client {} channel {}: {:?}", self.name, lcid, event);
        self.log.lock().push(event);
        self.changed.notify_waiters();
    }

    fn get_rx_buffer(&self, lcid: u8, len: usize) -> Result<Option<Vec<u8>>, RxBufferError> {
        self.buffer_requests.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .script
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.lock().clone());
        debug!(
            "Client {} channel {} buffer request for {} bytes: {:?}",
            self.name, lcid, len, reply
        );
        match reply {
            RxReply::Accept => Ok(Some(Vec::with_capacity(len))),
            RxReply::TryAgain => Err(RxBufferError::TryAgain),
            RxReply::Reject => Err(RxBufferError::Rejected(format!(
                "client {} rejects data",
                self.name
            ))),
        }
    }
}

impl std::fmt::Debug for ScriptedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedClient")
            .field("name", &self.name)
            .field("events", &self.log.lock().len())
            .finish()
    }
}
