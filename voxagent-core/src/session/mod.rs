//! `SessionController`: lifecycle of one realtime call.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle ──start()──► Connecting ──handshake sent──► Active ──stop()──► Closing ──► Idle
//!                                                    │
//!                              backend closed / transport failed
//!                                                    ▼
//!                                              Disconnected ──start()/stop()──►
//! ```
//!
//! `start()` and `stop()` are serialized by an async lifecycle lock. A
//! `start()` while a session exists tears the old one down completely
//! before opening the new one, so there is never more than one live
//! channel + capture pair.
//!
//! The channel of a `start()` still in progress is also reachable outside
//! that lock: `stop()` closes it first, which fails the handshake and makes
//! `start()` roll back and release the lock.
//!
//! The handler runs on the receive loop task and may call `stop()` or
//! `start()` itself; teardown then leaves that task to finish on its own.
//!
//! ## Threading
//!
//! Opening and closing audio devices blocks (the backends join their device
//! threads), so those calls run under `spawn_blocking`. Two tasks run per
//! session: the frame forwarder (capture → channel) and the router
//! (channel → playback / handler). They share only the channel and the
//! diagnostics counters.

pub mod config;
pub mod diagnostics;
pub mod handler;
mod router;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    audio::{
        pcm::WIRE_SAMPLE_RATE, AnalyzerHandle, AudioBackend, CaptureHandle, CaptureSink,
        MuteFlag, PlaybackHandle,
    },
    channel::Channel,
    error::{Result, VoxError},
    ipc::events::{CaptureActivityEvent, SessionStatus, SessionStatusEvent},
    protocol::Envelope,
};

use config::SessionConfig;
use diagnostics::{DiagnosticsSnapshot, SessionDiagnostics};
use handler::EnvelopeHandler;
use router::{forward_frames, Router};

/// Broadcast channel capacity for status and activity events.
const BROADCAST_CAP: usize = 256;

/// How long teardown waits for the router to finish its current envelope.
const ROUTER_GRACE: Duration = Duration::from_secs(2);

type AnalyzerCallback = Arc<dyn Fn(AnalyzerHandle) + Send + Sync>;

struct CurrentStatus {
    status: SessionStatus,
    /// Bumped by every `start()`.
    session: u64,
}

/// Current status plus a broadcast of every change.
pub(crate) struct StatusPublisher {
    current: Mutex<CurrentStatus>,
    tx: broadcast::Sender<SessionStatusEvent>,
}

impl StatusPublisher {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            current: Mutex::new(CurrentStatus {
                status: SessionStatus::Idle,
                session: 0,
            }),
            tx,
        }
    }

    fn get(&self) -> SessionStatus {
        self.current.lock().status
    }

    fn set(&self, status: SessionStatus, detail: Option<String>) {
        let mut current = self.current.lock();
        current.status = status;
        let _ = self.tx.send(SessionStatusEvent { status, detail });
    }

    /// Enter `Connecting` for a new session and return its id.
    fn begin_session(&self) -> u64 {
        let mut current = self.current.lock();
        current.session += 1;
        current.status = SessionStatus::Connecting;
        let _ = self.tx.send(SessionStatusEvent {
            status: SessionStatus::Connecting,
            detail: None,
        });
        current.session
    }

    /// Move to `to` only if `session` is still the latest session and the
    /// current status is one of `from`.
    pub(crate) fn transition(
        &self,
        session: u64,
        from: &[SessionStatus],
        to: SessionStatus,
        detail: Option<String>,
    ) -> bool {
        let mut current = self.current.lock();
        if current.session != session || !from.contains(&current.status) {
            return false;
        }
        current.status = to;
        let _ = self.tx.send(SessionStatusEvent { status: to, detail });
        true
    }
}

/// Resources owned by one live session.
struct ActiveSession {
    channel: Channel,
    capture: Box<dyn CaptureHandle>,
    playback: Arc<dyn PlaybackHandle>,
    forwarder: JoinHandle<()>,
    router: JoinHandle<()>,
}

/// Builder for [`SessionController`].
pub struct SessionControllerBuilder {
    config: SessionConfig,
    backend: Arc<dyn AudioBackend>,
    handler: Arc<dyn EnvelopeHandler>,
    on_analyzer: Option<AnalyzerCallback>,
}

impl SessionControllerBuilder {
    /// Called with the playback analyzer each time a session's playback
    /// starts.
    pub fn on_analyzer(mut self, f: impl Fn(AnalyzerHandle) + Send + Sync + 'static) -> Self {
        self.on_analyzer = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> SessionController {
        let (activity_tx, _) = broadcast::channel(BROADCAST_CAP);
        SessionController {
            muted: MuteFlag::new(self.config.start_muted),
            config: self.config,
            backend: self.backend,
            handler: self.handler,
            on_analyzer: self.on_analyzer,
            lifecycle: tokio::sync::Mutex::new(None),
            link: Mutex::new(None),
            opening: Mutex::new(None),
            status: Arc::new(StatusPublisher::new()),
            activity_tx,
            diagnostics: Arc::new(SessionDiagnostics::default()),
            analyzer: Mutex::new(None),
        }
    }
}

/// Owns at most one live session against the agent backend.
///
/// `SessionController` is `Send + Sync`; wrap it in an `Arc` to drive it
/// from several tasks.
pub struct SessionController {
    config: SessionConfig,
    backend: Arc<dyn AudioBackend>,
    handler: Arc<dyn EnvelopeHandler>,
    on_analyzer: Option<AnalyzerCallback>,
    /// Serializes start/stop and holds the live session.
    lifecycle: tokio::sync::Mutex<Option<ActiveSession>>,
    /// Send path; populated only while Active.
    link: Mutex<Option<Channel>>,
    /// Channel of a `start()` that has not finished yet.
    opening: Mutex<Option<Channel>>,
    status: Arc<StatusPublisher>,
    /// Persists across sessions.
    muted: MuteFlag,
    activity_tx: broadcast::Sender<CaptureActivityEvent>,
    diagnostics: Arc<SessionDiagnostics>,
    analyzer: Mutex<Option<AnalyzerHandle>>,
}

impl SessionController {
    pub fn builder(
        config: SessionConfig,
        backend: impl AudioBackend,
        handler: impl EnvelopeHandler,
    ) -> SessionControllerBuilder {
        SessionControllerBuilder {
            config,
            backend: Arc::new(backend),
            handler: Arc::new(handler),
            on_analyzer: None,
        }
    }

    /// Open a session: channel, playback, capture, then the `settings` and
    /// `interrupt` handshake. Returns once the handshake has been written.
    ///
    /// `input_device` overrides the configured device for this session.
    /// An existing session is stopped first.
    ///
    /// # Errors
    /// - `InvalidConfig` for a bad endpoint or identity.
    /// - `DeviceUnavailable` if audio devices cannot be opened.
    /// - `Channel` if the connection fails before the handshake is written.
    ///
    /// On error every resource acquired so far has been released and the
    /// status is `Idle`.
    pub async fn start(&self, input_device: Option<&str>) -> Result<()> {
        let mut slot = self.lifecycle.lock().await;
        if let Some(previous) = slot.take() {
            info!("replacing existing session");
            self.teardown(previous).await;
        }

        let url = self.config.session_url()?;
        let device = input_device
            .unwrap_or(&self.config.input_device)
            .to_string();

        self.diagnostics.reset();
        let session_id = self.status.begin_session();
        info!(%url, %device, session_id, "starting session");

        let opened = self.open_session(session_id, &url, &device).await;
        self.opening.lock().take();
        let session = match opened {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "session start failed");
                self.status.set(SessionStatus::Idle, Some(e.to_string()));
                return Err(e);
            }
        };

        let channel = session.channel.clone();
        *slot = Some(session);
        if self
            .status
            .transition(session_id, &[SessionStatus::Connecting], SessionStatus::Active, None)
        {
            *self.link.lock() = Some(channel);
            info!("session active");
        } else {
            warn!("channel ended during start; session is disconnected");
        }
        Ok(())
    }

    /// Tear down the current session, if any. Always leaves the controller
    /// `Idle` with every device and the channel released.
    ///
    /// A `start()` still connecting is cancelled: it fails with
    /// `ChannelNotOpen` after releasing what it had opened.
    pub async fn stop(&self) -> Result<()> {
        let opening = self.opening.lock().clone();
        if let Some(channel) = opening {
            info!("cancelling session start");
            channel.close().await;
        }
        let mut slot = self.lifecycle.lock().await;
        match slot.take() {
            Some(session) => self.teardown(session).await,
            None => debug!("stop: no session"),
        }
        Ok(())
    }

    /// `start(None)` when idle or disconnected, `stop()` when active.
    ///
    /// # Errors
    /// `InvalidState` while connecting or closing.
    pub async fn toggle(&self) -> Result<()> {
        match self.status() {
            SessionStatus::Idle | SessionStatus::Disconnected => self.start(None).await,
            SessionStatus::Active => self.stop().await,
            other => Err(VoxError::InvalidState(other)),
        }
    }

    /// Forward an envelope to the backend. A no-op while no session is
    /// active.
    ///
    /// # Errors
    /// `ChannelNotOpen`/`Channel` if the session's channel went away
    /// underneath the call.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let channel = self.link.lock().clone();
        match channel {
            Some(channel) => channel.send(envelope).await,
            None => {
                debug!(kind = %envelope.kind(), "send ignored: no active session");
                Ok(())
            }
        }
    }

    pub async fn send_user_message(&self, text: impl Into<String>) -> Result<()> {
        self.send(&Envelope::user_message(text)).await
    }

    /// Ask the backend to take a turn now.
    pub async fn request_response(&self) -> Result<()> {
        self.send(&Envelope::interrupt()).await
    }

    pub async fn complete_function(
        &self,
        call_id: impl Into<String>,
        output: impl Into<String>,
    ) -> Result<()> {
        self.send(&Envelope::function_completion(call_id, output))
            .await
    }

    /// Mute or unmute the microphone. Capture keeps running either way.
    pub fn mute(&self, muted: bool) {
        if self.muted.is_muted() != muted {
            info!(muted, "microphone mute changed");
        }
        self.muted.set(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.is_muted()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.get()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status.tx.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<CaptureActivityEvent> {
        self.activity_tx.subscribe()
    }

    /// Playback level tap of the current session, if one is running.
    pub fn analyzer(&self) -> Option<AnalyzerHandle> {
        self.analyzer.lock().clone()
    }

    /// Counters of the current (or last) session.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        if let Some(channel) = self.link.lock().as_ref() {
            self.diagnostics
                .record_undecodable(channel.undecodable_frames());
        }
        self.diagnostics.snapshot()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    async fn open_session(
        &self,
        session_id: u64,
        url: &str,
        device: &str,
    ) -> Result<ActiveSession> {
        let channel = Channel::open(url);
        *self.opening.lock() = Some(channel.clone());

        let backend = Arc::clone(&self.backend);
        let playback =
            match blocking(move || backend.start_playback(WIRE_SAMPLE_RATE)).await {
                Ok(playback) => playback,
                Err(e) => {
                    channel.close().await;
                    return Err(e);
                }
            };
        let analyzer = playback.analyzer();
        *self.analyzer.lock() = Some(analyzer.clone());
        if let Some(callback) = &self.on_analyzer {
            callback(analyzer);
        }

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let sink = CaptureSink::new(
            self.muted.clone(),
            frame_tx,
            self.activity_tx.clone(),
            Arc::clone(&self.diagnostics),
        );
        let backend = Arc::clone(&self.backend);
        let device_id = device.to_string();
        let capture = match blocking(move || backend.start_capture(&device_id, sink)).await {
            Ok(capture) => capture,
            Err(e) => {
                self.release(None, &channel, &playback).await;
                return Err(e);
            }
        };

        // Frames captured meanwhile wait in `frame_rx` until the forwarder
        // starts below, after the handshake.
        let settings =
            Envelope::settings(self.config.identity.clone(), self.config.settings.clone());
        let handshake = async {
            channel.send(&settings).await?;
            channel.send(&Envelope::interrupt()).await
        };
        if let Err(e) = handshake.await {
            self.release(Some(capture), &channel, &playback).await;
            return Err(e);
        }
        debug!("handshake written");

        let forwarder = tokio::spawn(forward_frames(
            frame_rx,
            channel.clone(),
            Arc::clone(&self.diagnostics),
        ));
        let router = tokio::spawn(
            Router {
                channel: channel.clone(),
                playback: Arc::clone(&playback),
                handler: Arc::clone(&self.handler),
                diagnostics: Arc::clone(&self.diagnostics),
                status: Arc::clone(&self.status),
                session_id,
            }
            .run(),
        );

        Ok(ActiveSession {
            channel,
            capture,
            playback,
            forwarder,
            router,
        })
    }

    /// Roll back a partially opened session.
    async fn release(
        &self,
        capture: Option<Box<dyn CaptureHandle>>,
        channel: &Channel,
        playback: &Arc<dyn PlaybackHandle>,
    ) {
        if let Some(capture) = capture {
            stop_capture(capture).await;
        }
        channel.close().await;
        close_playback(Arc::clone(playback)).await;
        *self.analyzer.lock() = None;
    }

    async fn teardown(&self, session: ActiveSession) {
        self.status.set(SessionStatus::Closing, None);
        info!("stopping session");

        let ActiveSession {
            channel,
            capture,
            playback,
            forwarder,
            mut router,
        } = session;
        // Publishes Idle and releases playback even if this future is
        // cancelled part way.
        let mut closed = ClosedOnDrop {
            controller: self,
            playback: Some(Arc::clone(&playback)),
            channel: channel.clone(),
        };

        self.link.lock().take();
        playback.clear();
        stop_capture(capture).await;
        channel.close().await;
        forwarder.abort();

        if tokio::task::try_id() == Some(router.id()) {
            // Called from the handler: the receive loop ends by itself once
            // the handler returns to the closed channel.
            debug!("teardown from the receive loop");
        } else if tokio::time::timeout(ROUTER_GRACE, &mut router).await.is_err() {
            warn!("receive loop did not finish in time, aborting");
            router.abort();
        }

        if let Some(playback) = closed.playback.take() {
            close_playback(playback).await;
        }
    }

    fn finish_teardown(&self, channel: &Channel) {
        *self.analyzer.lock() = None;
        self.diagnostics.record_undecodable(channel.undecodable_frames());
        info!(diagnostics = ?self.diagnostics.snapshot(), "session closed");
        self.status.set(SessionStatus::Idle, None);
    }
}

/// Completes a teardown when dropped, whether it ran to the end or not.
struct ClosedOnDrop<'a> {
    controller: &'a SessionController,
    /// Still open; closed on drop if teardown was cut short.
    playback: Option<Arc<dyn PlaybackHandle>>,
    channel: Channel,
}

impl Drop for ClosedOnDrop<'_> {
    fn drop(&mut self) {
        if let Some(playback) = self.playback.take() {
            warn!("teardown interrupted, closing playback");
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn_blocking(move || playback.close());
                }
                Err(_) => playback.close(),
            }
        }
        self.controller.finish_teardown(&self.channel);
    }
}

/// Run a blocking device operation off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| VoxError::Other(anyhow::anyhow!("audio task failed: {e}")))?
}

async fn stop_capture(capture: Box<dyn CaptureHandle>) {
    if let Err(e) = tokio::task::spawn_blocking(move || capture.stop()).await {
        warn!(error = %e, "capture stop task failed");
    }
}

async fn close_playback(playback: Arc<dyn PlaybackHandle>) {
    if let Err(e) = tokio::task::spawn_blocking(move || playback.close()).await {
        warn!(error = %e, "playback close task failed");
    }
}
