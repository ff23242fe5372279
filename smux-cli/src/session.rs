//! One logical channel driven from the terminal

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use smux_engine::{ChannelClient, ChannelEvent, MuxEngine, MuxError};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Largest payload handed to the engine in one write
const WRITE_CHUNK: usize = 1024;

/// How long to wait for the peer to finish closing
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Client that forwards engine events into a channel
struct ForwardingClient {
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl ChannelClient for ForwardingClient {
    fn notify(&self, _lcid: u8, event: ChannelEvent) {
        let _ = self.tx.send(event);
    }
}

fn open_forwarding(
    engine: &MuxEngine,
    lcid: u8,
) -> Result<mpsc::UnboundedReceiver<ChannelEvent>, MuxError> {
    let (tx, rx) = mpsc::unbounded_channel();
    engine.open(lcid, Arc::new(ForwardingClient { tx }))?;
    Ok(rx)
}

/// Outgoing data waiting for room below the channel's high watermark
struct Writer {
    engine: MuxEngine,
    lcid: u8,
    backlog: VecDeque<Vec<u8>>,
    next_token: u64,
    in_flight: usize,
}

impl Writer {
    fn new(engine: MuxEngine, lcid: u8) -> Self {
        Self {
            engine,
            lcid,
            backlog: VecDeque::new(),
            next_token: 0,
            in_flight: 0,
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.backlog
            .extend(data.chunks(WRITE_CHUNK).map(|chunk| chunk.to_vec()));
    }

    /// Hand queued data to the engine until it pushes back
    fn flush(&mut self) -> Result<(), MuxError> {
        while let Some(chunk) = self.backlog.front() {
            match self.engine.write(self.lcid, self.next_token, chunk) {
                Ok(()) => {
                    self.backlog.pop_front();
                    self.next_token += 1;
                    self.in_flight += 1;
                }
                Err(MuxError::WouldOverflow { pending, .. }) => {
                    debug!("Channel {} full with {} pending", self.lcid, pending);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn completed(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    fn is_idle(&self) -> bool {
        self.backlog.is_empty() && self.in_flight == 0
    }
}

enum Input {
    Line(Option<String>),
    Event(Option<ChannelEvent>),
    Interrupt,
}

/// What the session loop does after an event
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Continue,
    Close,
    Done,
}

/// Terminal session on one channel
pub struct Session {
    lcid: u8,
    engine: MuxEngine,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    writer: Writer,
    connected: bool,
    disconnected: bool,
}

impl Session {
    /// Open `lcid` on `engine`
    pub fn open(engine: MuxEngine, lcid: u8) -> anyhow::Result<Self> {
        let events = open_forwarding(&engine, lcid)?;
        info!("Waiting for peer to open channel {}", lcid);
        Ok(Self {
            lcid,
            writer: Writer::new(engine.clone(), lcid),
            engine,
            events,
            connected: false,
            disconnected: false,
        })
    }

    /// Send stdin lines and print received data until stdin ends or the
    /// channel goes away
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();
        let mut stdin_open = true;

        loop {
            let input = tokio::select! {
                line = lines.next_line(), if stdin_open => Input::Line(line?),
                event = self.events.recv() => Input::Event(event),
                _ = tokio::signal::ctrl_c() => Input::Interrupt,
            };

            match input {
                Input::Line(Some(mut line)) => {
                    line.push('\n');
                    self.writer.push(line.as_bytes());
                }
                Input::Line(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Input::Event(None) => bail!("engine dropped channel {}", self.lcid),
                Input::Event(Some(event)) => match self.handle_event(event, &mut stdout).await? {
                    Step::Continue => {}
                    Step::Close => break,
                    Step::Done => return Ok(()),
                },
                Input::Interrupt => {
                    info!("Interrupted");
                    break;
                }
            }

            if self.connected {
                self.writer.flush()?;
            }
            if !stdin_open && self.connected && self.writer.is_idle() {
                break;
            }
        }

        self.close().await
    }

    async fn handle_event<W: AsyncWrite + Unpin>(
        &mut self,
        event: ChannelEvent,
        out: &mut W,
    ) -> anyhow::Result<Step> {
        match event {
            ChannelEvent::Connected => {
                info!("Channel {} connected", self.lcid);
                self.connected = true;
            }
            ChannelEvent::ReadDone { data } => {
                out.write_all(&data).await?;
                out.flush().await?;
            }
            ChannelEvent::ReadFail { len } => {
                warn!("Channel {} lost {} received bytes", self.lcid, len);
            }
            ChannelEvent::WriteDone { .. } => self.writer.completed(),
            ChannelEvent::WriteFail { token } => {
                warn!("Channel {} write {} failed", self.lcid, token);
                self.writer.completed();
            }
            ChannelEvent::RemoteClosed => {
                info!("Peer closed channel {}", self.lcid);
                return Ok(Step::Close);
            }
            ChannelEvent::Disconnected { transport_reset } => {
                self.disconnected = true;
                if transport_reset {
                    bail!("link reset while channel {} was open", self.lcid);
                }
                return Ok(Step::Done);
            }
            ChannelEvent::TiocmUpdate { old, new } => {
                debug!("Channel {} TIOCM 0x{:03X} -> 0x{:03X}", self.lcid, old, new);
            }
            other => debug!("Channel {}: {}", self.lcid, other.name()),
        }
        Ok(Step::Continue)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if self.disconnected {
            return Ok(());
        }
        self.engine.close(self.lcid)?;

        let events = &mut self.events;
        let closed = tokio::time::timeout(CLOSE_TIMEOUT, async {
            while let Some(event) = events.recv().await {
                if matches!(event, ChannelEvent::Disconnected { .. }) {
                    return true;
                }
            }
            false
        })
        .await;

        match closed {
            Ok(true) => info!("Channel {} closed", self.lcid),
            _ => warn!("Channel {} did not close within {:?}", self.lcid, CLOSE_TIMEOUT),
        }
        Ok(())
    }
}

/// Open `lcid` on `engine` and echo everything received on it
pub fn run_echo_peer(engine: MuxEngine, lcid: u8) -> anyhow::Result<()> {
    let mut events = open_forwarding(&engine, lcid)?;
    let mut writer = Writer::new(engine.clone(), lcid);

    tokio::spawn(async move {
        let mut connected = false;
        while let Some(event) = events.recv().await {
            match event {
                ChannelEvent::Connected => connected = true,
                ChannelEvent::ReadDone { data } => writer.push(&data),
                ChannelEvent::WriteDone { .. } | ChannelEvent::WriteFail { .. } => {
                    writer.completed()
                }
                ChannelEvent::RemoteClosed => {
                    if let Err(e) = engine.close(lcid) {
                        warn!("Echo peer failed to close channel {}: {}", lcid, e);
                    }
                }
                ChannelEvent::Disconnected { .. } => break,
                _ => {}
            }
            if connected {
                if let Err(e) = writer.flush() {
                    warn!("Echo peer write on channel {} failed: {}", lcid, e);
                }
            }
        }
        debug!("Echo peer on channel {} finished", lcid);
    });
    Ok(())
}
