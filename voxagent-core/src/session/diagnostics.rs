use std::sync::atomic::{AtomicUsize, Ordering};

/// Per-session counters, shared between the capture thread, the frame
/// forwarder and the receive loop.
#[derive(Default)]
pub struct SessionDiagnostics {
    pub frames_captured: AtomicUsize,
    pub frames_sent: AtomicUsize,
    pub muted_chunks_dropped: AtomicUsize,
    pub send_failures: AtomicUsize,
    pub envelopes_received: AtomicUsize,
    pub audio_frames_played: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub events_dispatched: AtomicUsize,
    /// Bad `audio` payloads.
    pub decode_errors: AtomicUsize,
    /// Inbound frames the channel could not decode at all.
    pub undecodable_frames: AtomicUsize,
}

impl SessionDiagnostics {
    pub fn reset(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_sent.store(0, Ordering::Relaxed);
        self.muted_chunks_dropped.store(0, Ordering::Relaxed);
        self.send_failures.store(0, Ordering::Relaxed);
        self.envelopes_received.store(0, Ordering::Relaxed);
        self.audio_frames_played.store(0, Ordering::Relaxed);
        self.interrupts.store(0, Ordering::Relaxed);
        self.events_dispatched.store(0, Ordering::Relaxed);
        self.decode_errors.store(0, Ordering::Relaxed);
        self.undecodable_frames.store(0, Ordering::Relaxed);
    }

    /// Copy the channel's undecodable frame count into the session counters.
    pub fn record_undecodable(&self, count: usize) {
        self.undecodable_frames.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            muted_chunks_dropped: self.muted_chunks_dropped.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            envelopes_received: self.envelopes_received.load(Ordering::Relaxed),
            audio_frames_played: self.audio_frames_played.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            undecodable_frames: self.undecodable_frames.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    pub frames_captured: usize,
    pub frames_sent: usize,
    pub muted_chunks_dropped: usize,
    pub send_failures: usize,
    pub envelopes_received: usize,
    pub audio_frames_played: usize,
    pub interrupts: usize,
    pub events_dispatched: usize,
    pub decode_errors: usize,
    pub undecodable_frames: usize,
}
