//! Inbound routing loop and outbound frame forwarder for one session.

use std::sync::{atomic::Ordering, Arc};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    audio::PlaybackHandle,
    channel::Channel,
    ipc::events::SessionStatus,
    protocol::{AudioFrame, Envelope},
    session::{diagnostics::SessionDiagnostics, handler::EnvelopeHandler, StatusPublisher},
};

pub(crate) struct Router {
    pub channel: Channel,
    pub playback: Arc<dyn PlaybackHandle>,
    pub handler: Arc<dyn EnvelopeHandler>,
    pub diagnostics: Arc<SessionDiagnostics>,
    pub status: Arc<StatusPublisher>,
    pub session_id: u64,
}

impl Router {
    /// Pull until the channel ends. `audio` goes to playback, `interrupt`
    /// flushes it, everything else is awaited on the handler in order.
    pub async fn run(self) {
        let ended = loop {
            match self.channel.recv().await {
                Ok(Some(envelope)) => self.route(envelope).await,
                Ok(None) => break None,
                Err(e) => break Some(e.to_string()),
            }
        };

        // Only a channel that ended on its own moves the session to
        // Disconnected; during teardown the status is already Closing, and a
        // newer session is never touched.
        let live = [SessionStatus::Connecting, SessionStatus::Active];
        if self.status.transition(
            self.session_id,
            &live,
            SessionStatus::Disconnected,
            ended.clone(),
        ) {
            match ended {
                Some(reason) => warn!(%reason, "session channel failed"),
                None => info!("backend closed the session"),
            }
        } else {
            debug!("receive loop finished");
        }
    }

    async fn route(&self, envelope: Envelope) {
        self.diagnostics
            .envelopes_received
            .fetch_add(1, Ordering::Relaxed);

        match envelope {
            Envelope::Audio(frame) => match frame.decode_pcm() {
                Ok(pcm) => {
                    self.playback.play(&pcm);
                    self.diagnostics
                        .audio_frames_played
                        .fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    self.diagnostics.decode_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(id = %frame.id, error = %e, "dropping undecodable audio frame");
                }
            },
            Envelope::Interrupt(_) => {
                debug!("interrupt: flushing playback");
                self.playback.clear();
                self.diagnostics.interrupts.fetch_add(1, Ordering::Relaxed);
            }
            other => {
                debug!(
                    kind = %other.kind(),
                    id = other.id(),
                    call_id = ?other.call_id(),
                    "dispatching"
                );
                self.handler.handle(other).await;
                self.diagnostics
                    .events_dispatched
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Wrap captured frames in `audio` envelopes and send them in capture order.
/// Stops at the first send failure; the capture thread notices the closed
/// queue and winds down.
pub(crate) async fn forward_frames(
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
    channel: Channel,
    diagnostics: Arc<SessionDiagnostics>,
) {
    while let Some(frame) = frames.recv().await {
        let envelope = Envelope::Audio(AudioFrame::from_bytes(&frame));
        match channel.send(&envelope).await {
            Ok(()) => {
                diagnostics.frames_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                diagnostics.send_failures.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "audio forwarding stopped");
                break;
            }
        }
    }
}
