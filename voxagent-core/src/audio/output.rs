//! Speaker playback via cpal.
//!
//! Like capture, the output stream is `!Send`, so it lives on its own
//! thread for the lifetime of the session. Inbound audio is converted from
//! the wire rate to the device rate on the caller's thread and queued in a
//! [`PlaybackBuffer`]; the output callback only drains that buffer.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, Stream,
};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::{
    audio::{
        device::find_output_device,
        pcm::{f32_to_i16, i16_to_f32},
        playback::{AnalyzerHandle, PlaybackBuffer},
        resample::RateConverter,
        PlaybackHandle,
    },
    error::{Result, VoxError},
};

/// Resampler block size on the playback side (20 ms at 24 kHz).
const PLAYBACK_CHUNK: usize = 480;

fn open_output_stream(
    device_id: Option<&str>,
    buffer: Arc<PlaybackBuffer>,
) -> Result<(Stream, u32)> {
    let device = find_output_device(device_id)?;
    info!(
        device = device.name().unwrap_or_default().as_str(),
        "opening output device"
    );

    let supported = device
        .default_output_config()
        .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels() as usize;
    let config = supported.config();
    info!(sample_rate, channels, "output config selected");

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &config,
            move |data: &mut [f32], _info| buffer.fill_interleaved(data, channels),
            |err| error!("output stream error: {err}"),
            None,
        ),
        SampleFormat::I16 => {
            // Grows to the callback period once, then reused.
            let mut scratch: Vec<f32> = Vec::new();
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _info| {
                    scratch.resize(data.len(), 0.0);
                    buffer.fill_interleaved(&mut scratch, channels);
                    for (out, s) in data.iter_mut().zip(&scratch) {
                        *out = f32_to_i16(*s);
                    }
                },
                |err| error!("output stream error: {err}"),
                None,
            )
        }
        fmt => {
            return Err(VoxError::AudioStream(format!(
                "unsupported output sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))?;

    stream
        .play()
        .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))?;

    Ok((stream, sample_rate))
}

/// Live speaker output for one session.
pub struct CpalPlayback {
    buffer: Arc<PlaybackBuffer>,
    /// Wire rate → device rate. Held across `push` so `clear` cannot
    /// interleave with a half-queued frame.
    converter: Mutex<RateConverter>,
    stop_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CpalPlayback {
    /// Open the output device and start the (initially silent) stream.
    ///
    /// # Errors
    /// `DeviceUnavailable` if no output device can be opened.
    pub fn start(device_id: Option<&str>, source_rate: u32) -> Result<Self> {
        let buffer = Arc::new(PlaybackBuffer::new());
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<u32>>(1);
        let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = crossbeam_channel::bounded(1);

        let device_id = device_id.map(str::to_string);
        let thread_buffer = Arc::clone(&buffer);
        let thread = thread::Builder::new()
            .name("voxagent-playback".into())
            .spawn(move || {
                let stream = match open_output_stream(device_id.as_deref(), thread_buffer) {
                    Ok((stream, rate)) => {
                        let _ = open_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                // Parked until close() sends or drops the stop sender.
                let _ = stop_rx.recv();
                drop(stream);
                debug!("playback thread exiting");
            })?;

        let device_rate = match open_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(VoxError::AudioStream(
                    "playback thread exited before opening the device".into(),
                ));
            }
        };

        let converter = match RateConverter::new(source_rate, device_rate, PLAYBACK_CHUNK) {
            Ok(converter) => converter,
            Err(e) => {
                drop(stop_tx);
                let _ = thread.join();
                return Err(e);
            }
        };
        info!(source_rate, device_rate, "playback started");

        Ok(Self {
            buffer,
            converter: Mutex::new(converter),
            stop_tx: Mutex::new(Some(stop_tx)),
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl PlaybackHandle for CpalPlayback {
    fn play(&self, pcm: &[i16]) {
        let samples: Vec<f32> = pcm.iter().map(|&s| i16_to_f32(s)).collect();
        let mut converter = self.converter.lock();
        let converted = converter.process(&samples);
        self.buffer.push(&converted);
    }

    fn clear(&self) {
        let mut converter = self.converter.lock();
        converter.reset();
        let dropped = self.buffer.clear();
        if dropped > 0 {
            debug!(dropped, "playback flushed");
        }
    }

    fn analyzer(&self) -> AnalyzerHandle {
        self.buffer.analyzer()
    }

    fn close(&self) {
        self.clear();
        if let Some(stop_tx) = self.stop_tx.lock().take() {
            let _ = stop_tx.send(());
        }
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                error!("playback thread panicked");
            }
            info!("playback closed");
        }
    }
}

impl Drop for CpalPlayback {
    fn drop(&mut self) {
        // Dropping the sender unparks the thread; it is not joined here.
        self.stop_tx.lock().take();
    }
}
