//! Playback buffer and level tap.
//!
//! Decoded inbound audio is queued in a [`PlaybackBuffer`] that the output
//! device callback drains. The callback only ever `try_lock`s the queue: on
//! contention it writes silence for that period instead of blocking the
//! audio thread.

use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use parking_lot::Mutex;

/// Live amplitude tap over the audio being played.
///
/// Cheap to clone; intended for visualisation only.
#[derive(Debug, Clone, Default)]
pub struct AnalyzerHandle(Arc<LevelState>);

#[derive(Debug, Default)]
struct LevelState {
    rms_bits: AtomicU32,
    peak_bits: AtomicU32,
    playing: AtomicBool,
}

impl AnalyzerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// RMS of the most recent output period in [0.0, 1.0].
    pub fn level(&self) -> f32 {
        f32::from_bits(self.0.rms_bits.load(Ordering::Relaxed))
    }

    /// Absolute peak of the most recent output period in [0.0, 1.0].
    pub fn peak(&self) -> f32 {
        f32::from_bits(self.0.peak_bits.load(Ordering::Relaxed))
    }

    /// Whether the most recent output period contained queued audio.
    pub fn is_playing(&self) -> bool {
        self.0.playing.load(Ordering::Relaxed)
    }

    fn publish(&self, rms: f32, peak: f32, playing: bool) {
        self.0.rms_bits.store(rms.to_bits(), Ordering::Relaxed);
        self.0.peak_bits.store(peak.to_bits(), Ordering::Relaxed);
        self.0.playing.store(playing, Ordering::Relaxed);
    }
}

/// Mono f32 queue between the session and the output callback.
#[derive(Default)]
pub struct PlaybackBuffer {
    queue: Mutex<VecDeque<f32>>,
    analyzer: AnalyzerHandle,
}

impl PlaybackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn analyzer(&self) -> AnalyzerHandle {
        self.analyzer.clone()
    }

    pub fn push(&self, samples: &[f32]) {
        self.queue.lock().extend(samples.iter().copied());
    }

    /// Drop everything not yet played. Returns the number of discarded samples.
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill an interleaved output buffer, duplicating each mono sample
    /// across `channels`. Called from the real-time output callback.
    pub fn fill_interleaved(&self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        let Some(mut queue) = self.queue.try_lock() else {
            out.fill(0.0);
            self.analyzer.publish(0.0, 0.0, false);
            return;
        };

        let mut sum_sq = 0f32;
        let mut peak = 0f32;
        let mut played = 0usize;
        for frame in out.chunks_mut(channels) {
            let sample = match queue.pop_front() {
                Some(s) => {
                    played += 1;
                    sum_sq += s * s;
                    peak = peak.max(s.abs());
                    s
                }
                None => 0.0,
            };
            frame.fill(sample);
        }
        drop(queue);

        let frames = out.len().div_ceil(channels).max(1);
        let rms = (sum_sq / frames as f32).sqrt();
        self.analyzer.publish(rms, peak, played > 0);
    }
}
