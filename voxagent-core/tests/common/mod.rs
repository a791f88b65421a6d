//! Shared fixtures: an in-process WebSocket backend and an in-memory audio
//! backend.

#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        Message,
    },
};

use voxagent_core::{
    audio::{AnalyzerHandle, AudioBackend, CaptureHandle, CaptureSink, PlaybackHandle},
    Envelope, Result, VoxError,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Mock backend
// ---------------------------------------------------------------------------

enum Control {
    Send(String),
    Close,
    Drop,
}

/// A WebSocket server bound to an ephemeral local port. Connections are
/// accepted one at a time with [`MockBackend::accept`]; until then, clients
/// stay in the opening handshake.
pub struct MockBackend {
    listener: TcpListener,
    url: String,
}

impl MockBackend {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock backend");
        let addr = listener.local_addr().expect("local addr");
        Self {
            listener,
            url: format!("ws://{addr}"),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Accept the next connection that completes a WebSocket handshake.
    /// Connections abandoned by the client before the handshake are skipped.
    pub async fn accept(&self) -> MockConn {
        let path = Arc::new(Mutex::new(String::new()));
        let ws = tokio::time::timeout(TIMEOUT, async {
            loop {
                let (stream, _) = self.listener.accept().await.expect("accept");
                let path_slot = Arc::clone(&path);
                let record_path = move |req: &Request,
                                        resp: Response|
                      -> std::result::Result<Response, ErrorResponse> {
                    *path_slot.lock() = req.uri().path().to_string();
                    Ok(resp)
                };
                if let Ok(ws) = accept_hdr_async(stream, record_path).await {
                    break ws;
                }
            }
        })
        .await
        .expect("client connected in time");

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let client_closed = Arc::new(AtomicBool::new(false));
        let closed_flag = Arc::clone(&client_closed);

        tokio::spawn(async move {
            let (mut write, mut read) = ws.split();
            loop {
                tokio::select! {
                    control = control_rx.recv() => match control {
                        Some(Control::Send(text)) => {
                            if write.send(Message::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        Some(Control::Close) => {
                            let _ = write.send(Message::Close(None)).await;
                        }
                        Some(Control::Drop) | None => return,
                    },
                    frame = read.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let _ = inbound_tx.send(text.to_string());
                        }
                        // Keep reading so tungstenite flushes its close reply.
                        Some(Ok(Message::Close(_))) => closed_flag.store(true, Ordering::SeqCst),
                        Some(Ok(_)) => {}
                        Some(Err(_)) | None => break,
                    },
                }
            }
        });

        let path = path.lock().clone();
        MockConn {
            path,
            inbound: inbound_rx,
            control: control_tx,
            client_closed,
        }
    }
}

/// One accepted client connection.
pub struct MockConn {
    pub path: String,
    inbound: mpsc::UnboundedReceiver<String>,
    control: mpsc::UnboundedSender<Control>,
    client_closed: Arc<AtomicBool>,
}

impl MockConn {
    pub fn send_text(&self, text: impl Into<String>) {
        let _ = self.control.send(Control::Send(text.into()));
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(value.to_string());
    }

    pub fn send_envelope(&self, envelope: &Envelope) {
        self.send_text(envelope.encode().expect("encode"));
    }

    /// Start a clean close handshake.
    pub fn close(&self) {
        let _ = self.control.send(Control::Close);
    }

    /// Drop the TCP connection without a close frame.
    pub fn drop_connection(&self) {
        let _ = self.control.send(Control::Drop);
    }

    /// Next text frame from the client, `None` once the connection ended.
    pub async fn recv_text(&mut self) -> Option<String> {
        tokio::time::timeout(TIMEOUT, self.inbound.recv())
            .await
            .expect("client frame in time")
    }

    pub async fn recv_envelope(&mut self) -> Envelope {
        let text = self.recv_text().await.expect("connection still open");
        Envelope::decode(&text).expect("client sent a valid envelope")
    }

    /// Wait until the connection has ended, returning any frames received
    /// meanwhile.
    pub async fn closed(&mut self) -> Vec<String> {
        let mut rest = Vec::new();
        while let Some(text) = self.recv_text().await {
            rest.push(text);
        }
        rest
    }

    pub fn client_sent_close(&self) -> bool {
        self.client_closed.load(Ordering::SeqCst)
    }
}

/// A URL nothing is listening on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("ws://{addr}")
}

/// Poll `cond` until it holds or the shared timeout expires.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

// ---------------------------------------------------------------------------
// Fake audio backend
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    Played(Vec<i16>),
    Cleared,
}

#[derive(Default)]
struct FakeAudioState {
    sink: Mutex<Option<CaptureSink>>,
    playback_events: Mutex<Vec<PlaybackEvent>>,
    fail_capture: AtomicBool,
    fail_playback: AtomicBool,
    captures_started: AtomicUsize,
    captures_stopped: AtomicUsize,
    playbacks_started: AtomicUsize,
    playbacks_closed: AtomicUsize,
    devices: Mutex<Vec<String>>,
}

/// In-memory [`AudioBackend`]. Clones share state, so a test keeps one clone
/// to drive capture and inspect playback.
#[derive(Clone, Default)]
pub struct FakeAudio {
    state: Arc<FakeAudioState>,
}

impl FakeAudio {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_capture(&self, fail: bool) {
        self.state.fail_capture.store(fail, Ordering::SeqCst);
    }

    pub fn fail_playback(&self, fail: bool) {
        self.state.fail_playback.store(fail, Ordering::SeqCst);
    }

    /// Feed microphone samples (24 kHz mono) into the running capture.
    pub fn push_capture(&self, samples: &[f32]) -> bool {
        match self.state.sink.lock().as_mut() {
            Some(sink) => sink.push(samples),
            None => false,
        }
    }

    pub fn playback_events(&self) -> Vec<PlaybackEvent> {
        self.state.playback_events.lock().clone()
    }

    pub fn live_captures(&self) -> usize {
        self.state.captures_started.load(Ordering::SeqCst)
            - self.state.captures_stopped.load(Ordering::SeqCst)
    }

    pub fn live_playbacks(&self) -> usize {
        self.state.playbacks_started.load(Ordering::SeqCst)
            - self.state.playbacks_closed.load(Ordering::SeqCst)
    }

    pub fn captures_started(&self) -> usize {
        self.state.captures_started.load(Ordering::SeqCst)
    }

    pub fn playbacks_started(&self) -> usize {
        self.state.playbacks_started.load(Ordering::SeqCst)
    }

    /// Input devices requested so far, in order.
    pub fn devices(&self) -> Vec<String> {
        self.state.devices.lock().clone()
    }
}

impl AudioBackend for FakeAudio {
    fn start_capture(&self, device: &str, sink: CaptureSink) -> Result<Box<dyn CaptureHandle>> {
        self.state.devices.lock().push(device.to_string());
        if self.state.fail_capture.load(Ordering::SeqCst) {
            return Err(VoxError::DeviceUnavailable("permission denied".into()));
        }
        *self.state.sink.lock() = Some(sink);
        self.state.captures_started.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeCapture {
            state: Arc::clone(&self.state),
        }))
    }

    fn start_playback(&self, _sample_rate: u32) -> Result<Arc<dyn PlaybackHandle>> {
        if self.state.fail_playback.load(Ordering::SeqCst) {
            return Err(VoxError::DeviceUnavailable("no output device".into()));
        }
        self.state.playbacks_started.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakePlayback {
            state: Arc::clone(&self.state),
            analyzer: AnalyzerHandle::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeCapture {
    state: Arc<FakeAudioState>,
}

impl CaptureHandle for FakeCapture {
    fn stop(self: Box<Self>) {
        self.state.sink.lock().take();
        self.state.captures_stopped.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakePlayback {
    state: Arc<FakeAudioState>,
    analyzer: AnalyzerHandle,
    closed: AtomicBool,
}

impl PlaybackHandle for FakePlayback {
    fn play(&self, pcm: &[i16]) {
        self.state
            .playback_events
            .lock()
            .push(PlaybackEvent::Played(pcm.to_vec()));
    }

    fn clear(&self) {
        self.state
            .playback_events
            .lock()
            .push(PlaybackEvent::Cleared);
    }

    fn analyzer(&self) -> AnalyzerHandle {
        self.analyzer.clone()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.playbacks_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
