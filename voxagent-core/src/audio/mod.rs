//! Local audio: microphone capture, speaker playback and the PCM helpers
//! shared with the wire protocol.
//!
//! The session controller only talks to the [`AudioBackend`] trait. The
//! production backend is [`CpalBackend`]; tests substitute an in-memory one.
//!
//! ```text
//! mic ─► cpal callback ─► ring ─► capture thread ─► RateConverter(→24 kHz)
//!                                                        │
//!                                                   CaptureSink (mute, 4800-byte frames)
//!
//! audio envelope ─► PlaybackHandle::play ─► RateConverter(24 kHz→device)
//!                                                        │
//!                                     PlaybackBuffer ─► cpal output callback
//! ```

pub mod device;
pub mod framer;
pub mod pcm;
pub mod playback;
pub mod resample;

#[cfg(feature = "audio-cpal")]
pub mod capture;
#[cfg(feature = "audio-cpal")]
pub mod output;

use std::sync::Arc;

use crate::error::Result;

pub use device::{list_input_devices, list_output_devices, DeviceDirection, DeviceInfo};
pub use framer::{CaptureSink, MuteFlag, FRAME_BYTES, FRAME_SAMPLES};
pub use playback::{AnalyzerHandle, PlaybackBuffer};

/// Source of microphone audio and sink for agent speech.
pub trait AudioBackend: Send + Sync + 'static {
    /// Open the input device identified by `device` ("default" for the
    /// system default) and start delivering audio into `sink`.
    ///
    /// # Errors
    /// `DeviceUnavailable` when the device is missing or access is denied.
    fn start_capture(&self, device: &str, sink: CaptureSink) -> Result<Box<dyn CaptureHandle>>;

    /// Open the output device for audio arriving at `sample_rate`.
    fn start_playback(&self, sample_rate: u32) -> Result<Arc<dyn PlaybackHandle>>;
}

/// A running capture.
pub trait CaptureHandle: Send {
    /// Stop capturing and release the device. No audio reaches the sink
    /// after this returns.
    fn stop(self: Box<Self>);
}

/// A running playback stream.
pub trait PlaybackHandle: Send + Sync {
    /// Queue mono PCM16 samples at the stream's source rate.
    fn play(&self, pcm: &[i16]);

    /// Drop everything queued but not yet played.
    fn clear(&self);

    /// Amplitude tap over what is actually being played.
    fn analyzer(&self) -> AnalyzerHandle;

    /// Stop output and release the device. Idempotent.
    fn close(&self);
}

/// Audio backed by the host's default cpal host.
#[derive(Debug, Clone, Default)]
pub struct CpalBackend {
    output_device: Option<String>,
}

impl CpalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Play through the named output device instead of the default one.
    pub fn with_output_device(mut self, name: impl Into<String>) -> Self {
        self.output_device = Some(name.into());
        self
    }
}

#[cfg(feature = "audio-cpal")]
impl AudioBackend for CpalBackend {
    fn start_capture(&self, device: &str, sink: CaptureSink) -> Result<Box<dyn CaptureHandle>> {
        Ok(Box::new(capture::CpalCapture::start(device, sink)?))
    }

    fn start_playback(&self, sample_rate: u32) -> Result<Arc<dyn PlaybackHandle>> {
        Ok(Arc::new(output::CpalPlayback::start(
            self.output_device.as_deref(),
            sample_rate,
        )?))
    }
}

/// Stub when the `audio-cpal` feature is disabled.
#[cfg(not(feature = "audio-cpal"))]
impl AudioBackend for CpalBackend {
    fn start_capture(&self, _device: &str, _sink: CaptureSink) -> Result<Box<dyn CaptureHandle>> {
        Err(crate::error::VoxError::DeviceUnavailable(
            "compiled without audio-cpal feature".into(),
        ))
    }

    fn start_playback(&self, _sample_rate: u32) -> Result<Arc<dyn PlaybackHandle>> {
        Err(crate::error::VoxError::DeviceUnavailable(
            "compiled without audio-cpal feature".into(),
        ))
    }
}
