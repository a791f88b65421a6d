//! Capture-side framing and mute gating.
//!
//! Capture backends hand mono 24 kHz f32 audio to a [`CaptureSink`]. The sink
//! packs it into fixed 4800-byte PCM16 frames and forwards each completed
//! frame to the session. While muted, audio is discarded together with any
//! partially accumulated frame, so no frame that overlaps a muted stretch is
//! ever forwarded and the first frame after unmuting contains only fresh
//! audio.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::audio::pcm::{encode_pcm16_le, f32_to_i16, rms};
use crate::ipc::events::CaptureActivityEvent;
use crate::session::diagnostics::SessionDiagnostics;

/// Bytes per outbound audio frame (2400 PCM16 samples, 100 ms at 24 kHz).
pub const FRAME_BYTES: usize = 4_800;

/// Samples per outbound audio frame.
pub const FRAME_SAMPLES: usize = FRAME_BYTES / 2;

/// Shared microphone mute switch.
///
/// Written by the controller, read by the capture thread on every chunk.
/// A plain atomic: readers tolerate observing a toggle one chunk late.
#[derive(Debug, Clone, Default)]
pub struct MuteFlag(Arc<AtomicBool>);

impl MuteFlag {
    pub fn new(muted: bool) -> Self {
        Self(Arc::new(AtomicBool::new(muted)))
    }

    pub fn set(&self, muted: bool) {
        self.0.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Accumulates samples into fixed-size PCM16 frames.
pub struct Framer {
    pending: Vec<i16>,
    frame_samples: usize,
}

impl Framer {
    pub fn new(frame_samples: usize) -> Self {
        Self {
            pending: Vec::with_capacity(frame_samples),
            frame_samples: frame_samples.max(1),
        }
    }

    /// Append samples; `on_frame` receives the little-endian bytes of every
    /// frame completed by this call. The remainder stays pending.
    pub fn push(&mut self, samples: &[f32], mut on_frame: impl FnMut(Vec<u8>)) {
        for &sample in samples {
            self.pending.push(f32_to_i16(sample));
            if self.pending.len() == self.frame_samples {
                on_frame(encode_pcm16_le(&self.pending));
                self.pending.clear();
            }
        }
    }

    /// Discard the partially accumulated frame.
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn pending_samples(&self) -> usize {
        self.pending.len()
    }
}

/// Destination for captured audio, owned by whichever thread drives capture.
pub struct CaptureSink {
    framer: Framer,
    muted: MuteFlag,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    activity: broadcast::Sender<CaptureActivityEvent>,
    diagnostics: Arc<SessionDiagnostics>,
    seq: u64,
}

impl CaptureSink {
    pub fn new(
        muted: MuteFlag,
        frames: mpsc::UnboundedSender<Vec<u8>>,
        activity: broadcast::Sender<CaptureActivityEvent>,
        diagnostics: Arc<SessionDiagnostics>,
    ) -> Self {
        Self {
            framer: Framer::new(FRAME_SAMPLES),
            muted,
            frames,
            activity,
            diagnostics,
            seq: 0,
        }
    }

    /// Feed mono samples at [`crate::audio::pcm::WIRE_SAMPLE_RATE`].
    ///
    /// Returns `false` once the session side has gone away; the caller
    /// should stop capturing.
    pub fn push(&mut self, samples: &[f32]) -> bool {
        if self.frames.is_closed() {
            return false;
        }

        let muted = self.muted.is_muted();
        let _ = self.activity.send(CaptureActivityEvent {
            seq: self.seq,
            rms: rms(samples),
            muted,
        });
        self.seq = self.seq.wrapping_add(1);

        if muted {
            if self.framer.pending_samples() > 0 {
                debug!(
                    discarded = self.framer.pending_samples(),
                    "muted: dropping partial frame"
                );
            }
            self.framer.reset();
            self.diagnostics
                .muted_chunks_dropped
                .fetch_add(1, Ordering::Relaxed);
            return true;
        }

        let frames = &self.frames;
        let diagnostics = &self.diagnostics;
        let mut open = true;
        self.framer.push(samples, |frame| {
            diagnostics.frames_captured.fetch_add(1, Ordering::Relaxed);
            if frames.send(frame).is_err() {
                open = false;
            }
        });
        open
    }
}
