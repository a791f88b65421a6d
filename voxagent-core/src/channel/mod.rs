//! Duplex envelope channel over a single WebSocket connection.
//!
//! ## Design
//!
//! [`Channel::open`] returns immediately and spawns a driver task that owns
//! the socket. Outbound envelopes go through an unbounded command queue that
//! the driver only starts draining once the handshake has completed, so
//! anything sent while connecting is written, in call order, right after the
//! connection opens. Each send carries a oneshot ack that resolves once the
//! frame has been handed to the socket.
//!
//! Inbound text frames are decoded and pushed into an [`Inbox`]. Frames that
//! do not decode are logged, counted and skipped; binary frames are ignored.
//!
//! ```text
//!   send() ──► mpsc ──┐                ┌──► Inbox ──► recv() / incoming()
//!                     ├─► driver task ─┤
//!   close() ─► watch ─┘   (socket)     └──► watch<ChannelState>
//! ```

pub mod inbox;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use futures::{SinkExt, Stream, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use crate::error::{Result, VoxError};
use crate::protocol::Envelope;

pub use inbox::Inbox;

/// Upper bound on waiting for the peer to answer our close frame.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound on the TCP connect plus WebSocket upgrade.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state published by the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    /// Closed cleanly, by either side.
    Closed,
    /// The connection could not be established or broke.
    Failed(String),
}

impl ChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChannelState::Closed | ChannelState::Failed(_))
    }
}

struct Outbound {
    text: String,
    ack: oneshot::Sender<Result<()>>,
}

struct Shared {
    commands: mpsc::UnboundedSender<Outbound>,
    close_tx: watch::Sender<bool>,
    state: watch::Receiver<ChannelState>,
    inbox: Arc<Inbox>,
    closing: AtomicBool,
    undecodable: Arc<AtomicUsize>,
}

/// Handle to an envelope channel. Cheap to clone; all clones share one
/// connection. Dropping the last clone closes the connection.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<Shared>,
}

impl Channel {
    /// Start connecting to `url` in the background. Must be called from
    /// within a tokio runtime.
    pub fn open(url: impl Into<String>) -> Self {
        let url = url.into();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        let inbox = Arc::new(Inbox::new());
        let undecodable = Arc::new(AtomicUsize::new(0));

        let driver = Driver {
            url,
            commands: commands_rx,
            close_rx,
            inbox: Arc::clone(&inbox),
            state: state_tx,
            undecodable: Arc::clone(&undecodable),
        };
        tokio::spawn(driver.run());

        Self {
            shared: Arc::new(Shared {
                commands: commands_tx,
                close_tx,
                state: state_rx,
                inbox,
                closing: AtomicBool::new(false),
                undecodable,
            }),
        }
    }

    /// Send one envelope. Resolves once the frame has been written to the
    /// socket; while connecting, it waits for the connection to open.
    ///
    /// # Errors
    /// `ChannelNotOpen` after [`close`](Self::close) or a clean remote close,
    /// `Channel` if the transport failed, `Codec`/`Json` if the envelope
    /// could not be serialised.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        if self.shared.closing.load(Ordering::Acquire) {
            return Err(VoxError::ChannelNotOpen);
        }
        match self.state() {
            ChannelState::Closed => return Err(VoxError::ChannelNotOpen),
            ChannelState::Failed(reason) => return Err(VoxError::Channel(reason)),
            ChannelState::Connecting | ChannelState::Open => {}
        }

        let text = envelope.encode()?;
        let (ack, done) = oneshot::channel();
        self.shared
            .commands
            .send(Outbound { text, ack })
            .map_err(|_| VoxError::ChannelNotOpen)?;
        done.await.unwrap_or(Err(VoxError::ChannelNotOpen))
    }

    /// Next inbound envelope in arrival order.
    ///
    /// `Ok(None)` once the channel closed cleanly and everything received
    /// before the close has been consumed. Concurrent callers are served in
    /// the order they started waiting.
    pub async fn recv(&self) -> Result<Option<Envelope>> {
        self.shared.inbox.pull().await
    }

    /// Inbound envelopes as a stream. Ends after a clean close, or after
    /// yielding the first error.
    pub fn incoming(&self) -> impl Stream<Item = Result<Envelope>> + Send + 'static {
        futures::stream::unfold((self.clone(), false), |(channel, finished)| async move {
            if finished {
                return None;
            }
            match channel.recv().await {
                Ok(Some(envelope)) => Some((Ok(envelope), (channel, false))),
                Ok(None) => None,
                Err(e) => Some((Err(e), (channel, true))),
            }
        })
    }

    /// Wait until the connection attempt has resolved.
    ///
    /// # Errors
    /// `Channel` if connecting failed, `ChannelNotOpen` if the channel was
    /// closed before it opened.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.shared.state.clone();
        let state = rx
            .wait_for(|s| *s != ChannelState::Connecting)
            .await
            .map_err(|_| VoxError::ChannelNotOpen)?
            .clone();
        match state {
            ChannelState::Open => Ok(()),
            ChannelState::Failed(reason) => Err(VoxError::Channel(reason)),
            ChannelState::Closed | ChannelState::Connecting => Err(VoxError::ChannelNotOpen),
        }
    }

    /// Close the connection and wait until the driver has finished.
    ///
    /// Sends issued before this call are still written. Idempotent; the
    /// close handshake is abandoned after [`CLOSE_TIMEOUT`].
    pub async fn close(&self) {
        if !self.shared.closing.swap(true, Ordering::AcqRel) {
            debug!("channel close requested");
            let _ = self.shared.close_tx.send(true);
        }
        let mut rx = self.shared.state.clone();
        let _ = rx.wait_for(ChannelState::is_terminal).await;
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state.borrow().clone()
    }

    /// Watch connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.clone()
    }

    /// Number of inbound text frames that failed to decode.
    pub fn undecodable_frames(&self) -> usize {
        self.shared.undecodable.load(Ordering::Relaxed)
    }

    /// `(buffered envelopes, waiting receivers)`.
    pub fn queue_depths(&self) -> (usize, usize) {
        self.shared.inbox.queue_depths()
    }
}

/// Control flow decision after handling one inbound frame.
enum Flow {
    Continue,
    RemoteClosed,
}

struct Driver {
    url: String,
    commands: mpsc::UnboundedReceiver<Outbound>,
    close_rx: watch::Receiver<bool>,
    inbox: Arc<Inbox>,
    state: watch::Sender<ChannelState>,
    undecodable: Arc<AtomicUsize>,
}

impl Driver {
    async fn run(mut self) {
        let outcome = self.session().await;

        let terminal = match outcome {
            Ok(()) => {
                info!("channel closed");
                self.inbox.close();
                ChannelState::Closed
            }
            Err(reason) => {
                warn!(%reason, "channel failed");
                self.inbox.fail(reason.clone());
                ChannelState::Failed(reason)
            }
        };

        // Reject anything queued after the socket went away.
        self.commands.close();
        while let Ok(Outbound { ack, .. }) = self.commands.try_recv() {
            let err = match &terminal {
                ChannelState::Failed(reason) => VoxError::Channel(reason.clone()),
                _ => VoxError::ChannelNotOpen,
            };
            let _ = ack.send(Err(err));
        }

        self.state.send_replace(terminal);
    }

    async fn session(&mut self) -> std::result::Result<(), String> {
        debug!(url = %self.url, "connecting");

        let connect = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(self.url.as_str()));
        let mut ws = tokio::select! {
            biased;
            _ = close_requested(&mut self.close_rx) => return Ok(()),
            connected = connect => {
                match connected {
                    Ok(Ok((ws, response))) => {
                        info!(status = %response.status(), "channel open");
                        ws
                    }
                    Ok(Err(e)) => return Err(format!("connect failed: {e}")),
                    Err(_) => {
                        return Err(format!("connect timed out after {CONNECT_TIMEOUT:?}"));
                    }
                }
            }
        };
        self.state.send_replace(ChannelState::Open);

        loop {
            tokio::select! {
                biased;
                _ = close_requested(&mut self.close_rx) => {
                    return self.shutdown(&mut ws).await;
                }
                outbound = self.commands.recv() => match outbound {
                    Some(outbound) => write(&mut ws, outbound).await?,
                    // Every handle is gone.
                    None => return self.shutdown(&mut ws).await,
                },
                frame = ws.next() => match frame {
                    Some(Ok(message)) => {
                        if let Flow::RemoteClosed = self.handle_frame(message) {
                            let _ = ws.close(None).await;
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => return Err(format!("transport error: {e}")),
                    None => return Err("connection dropped without close handshake".into()),
                },
            }
        }
    }

    fn handle_frame(&self, message: Message) -> Flow {
        match message {
            Message::Text(text) => {
                trace!(len = text.len(), "frame received");
                match Envelope::decode(&text) {
                    Ok(envelope) => self.inbox.deliver(envelope),
                    Err(e) => {
                        self.undecodable.fetch_add(1, Ordering::Relaxed);
                        warn!(error = %e, "skipping undecodable frame");
                    }
                }
                Flow::Continue
            }
            Message::Binary(data) => {
                debug!(len = data.len(), "ignoring binary frame");
                Flow::Continue
            }
            Message::Close(frame) => {
                info!(?frame, "peer closed channel");
                Flow::RemoteClosed
            }
            // Ping/pong are answered by tungstenite.
            _ => Flow::Continue,
        }
    }

    /// Flush already-queued sends, send our close frame and wait (bounded)
    /// for the peer to finish the handshake.
    async fn shutdown(&mut self, ws: &mut Socket) -> std::result::Result<(), String> {
        while let Ok(outbound) = self.commands.try_recv() {
            write(ws, outbound).await?;
        }

        if let Err(e) = ws.close(None).await {
            debug!(error = %e, "close frame not sent");
            return Ok(());
        }

        let handshake = async {
            while let Some(frame) = ws.next().await {
                match frame {
                    Ok(message) => {
                        if let Flow::RemoteClosed = self.handle_frame(message) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        };
        if tokio::time::timeout(CLOSE_TIMEOUT, handshake).await.is_err() {
            warn!("peer did not complete close handshake in time");
        }
        Ok(())
    }
}

/// Resolves once `close()` was called or every handle was dropped.
async fn close_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closing| *closing).await;
}

/// Write one frame and acknowledge the caller. A write failure ends the
/// connection.
async fn write(ws: &mut Socket, outbound: Outbound) -> std::result::Result<(), String> {
    let Outbound { text, ack } = outbound;
    match ws.send(Message::Text(text.into())).await {
        Ok(()) => {
            let _ = ack.send(Ok(()));
            Ok(())
        }
        Err(e) => {
            let reason = format!("send failed: {e}");
            let _ = ack.send(Err(VoxError::Channel(reason.clone())));
            Err(reason)
        }
    }
}
