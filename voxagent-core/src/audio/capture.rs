//! Microphone capture via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate on the steady-state path, block on a mutex, or
//! perform I/O. It only mixes down to mono and writes into an SPSC ring
//! buffer producer whose `push_slice` is lock-free.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). The stream is therefore opened, driven and dropped on one
//! dedicated capture thread, which also drains the ring, resamples to the
//! wire rate and feeds the [`CaptureSink`]. The open result is reported back
//! over a bounded channel so `start` can fail synchronously.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SizedSample, Stream, StreamConfig,
};
use tracing::{debug, error, info, warn};

use crate::{
    audio::{
        device::find_input_device, framer::CaptureSink, pcm::WIRE_SAMPLE_RATE,
        resample::RateConverter, CaptureHandle,
    },
    buffering::{create_audio_ring, AudioConsumer, AudioProducer, Consumer, Producer},
    error::{Result, VoxError},
};

/// Samples drained from the ring per iteration (20 ms at 48 kHz).
const DRAIN_CHUNK: usize = 960;

/// Sleep when the ring is empty.
const EMPTY_SLEEP: Duration = Duration::from_millis(5);

/// An open input stream feeding a ring buffer.
///
/// **Not `Send`**: create and drop on the same OS thread.
struct InputStream {
    _stream: Stream,
    sample_rate: u32,
}

impl InputStream {
    fn open(device_id: &str, producer: AudioProducer, running: Arc<AtomicBool>) -> Result<Self> {
        let device = find_input_device(device_id)?;

        info!(
            device = device.name().unwrap_or_default().as_str(),
            "opening input device"
        );

        let supported = device
            .default_input_config()
            .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(sample_rate, channels, "input config selected");

        let config: StreamConfig = supported.config();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => {
                build_mono_input::<f32>(&device, &config, producer, running, |s| s)
            }
            SampleFormat::I16 => {
                build_mono_input::<i16>(&device, &config, producer, running, |s| s as f32 / 32768.0)
            }
            SampleFormat::U8 => build_mono_input::<u8>(&device, &config, producer, running, |s| {
                (s as f32 - 128.0) / 128.0
            }),
            fmt => {
                return Err(VoxError::AudioStream(format!(
                    "unsupported input sample format: {fmt:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            sample_rate,
        })
    }
}

/// Build an input stream that mixes interleaved frames down to mono f32.
fn build_mono_input<T: SizedSample + 'static>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    to_f32: fn(T) -> f32,
) -> Result<Stream> {
    let ch = config.channels.max(1) as usize;
    // Grows to the callback period once, then reused.
    let mut mix_buf: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / ch;
                mix_buf.resize(frames, 0.0);
                for (f, frame) in data.chunks_exact(ch).enumerate() {
                    let sum: f32 = frame.iter().map(|&s| to_f32(s)).sum();
                    mix_buf[f] = sum / ch as f32;
                }
                let written = producer.push_slice(&mix_buf);
                if written < mix_buf.len() {
                    warn!("ring buffer full: dropped {} frames", mix_buf.len() - written);
                }
            },
            |err| error!("input stream error: {err}"),
            None,
        )
        .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))
}

/// Running microphone capture. Stopping joins the capture thread, so once
/// [`CaptureHandle::stop`] returns no further frames are produced and the
/// device has been released.
pub struct CpalCapture {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CpalCapture {
    /// Open `device_id` and start feeding `sink`.
    ///
    /// # Errors
    /// `DeviceUnavailable` when the device is missing or access is denied.
    pub fn start(device_id: &str, sink: CaptureSink) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<u32>>(1);

        let device_id = device_id.to_string();
        let thread_running = Arc::clone(&running);
        let thread = thread::Builder::new()
            .name("voxagent-capture".into())
            .spawn(move || {
                let (producer, consumer) = create_audio_ring();
                let stream =
                    match InputStream::open(&device_id, producer, Arc::clone(&thread_running)) {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = open_tx.send(Err(e));
                            return;
                        }
                    };
                let converter =
                    RateConverter::new(stream.sample_rate, WIRE_SAMPLE_RATE, DRAIN_CHUNK);
                let converter = match converter {
                    Ok(converter) => converter,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                let _ = open_tx.send(Ok(stream.sample_rate));

                run_capture_loop(consumer, converter, sink, &thread_running);

                // Releases the microphone on the thread that opened it.
                drop(stream);
                debug!("capture thread exiting");
            })?;

        match open_rx.recv() {
            Ok(Ok(sample_rate)) => {
                info!(sample_rate, "capture started");
                Ok(Self {
                    running,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VoxError::AudioStream(
                    "capture thread exited before opening the device".into(),
                ))
            }
        }
    }
}

impl CaptureHandle for CpalCapture {
    fn stop(mut self: Box<Self>) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("capture thread panicked");
            }
        }
        info!("capture stopped");
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Drain the ring, convert to the wire rate and push into the sink until
/// stopped or the session side goes away.
fn run_capture_loop(
    mut consumer: AudioConsumer,
    mut converter: RateConverter,
    mut sink: CaptureSink,
    running: &AtomicBool,
) {
    let mut raw = vec![0f32; DRAIN_CHUNK];

    while running.load(Ordering::Acquire) {
        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            thread::sleep(EMPTY_SLEEP);
            continue;
        }

        let resampled = converter.process(&raw[..n]);
        if resampled.is_empty() {
            continue;
        }

        if !sink.push(&resampled) {
            debug!("frame receiver dropped, ending capture");
            break;
        }
    }
}
