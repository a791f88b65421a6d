//! # voxagent-core
//!
//! Realtime voice session client for a conversational agent backend.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → capture thread → CaptureSink (mute, 4800-byte frames) ─┐
//!                                                                      ▼
//!                                            forwarder → Channel (WebSocket, JSON envelopes)
//!                                                                      │
//!                             router ◄── Inbox (rendezvous queue) ◄────┘
//!                               │
//!               audio → PlaybackHandle::play    interrupt → PlaybackHandle::clear
//!               everything else → EnvelopeHandler (serialized, in order)
//! ```
//!
//! [`SessionController`] owns the lifecycle and wires the pieces together.
//! The audio callbacks never allocate on the steady-state path or block.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod channel;
pub mod error;
pub mod ipc;
pub mod protocol;
pub mod session;

// Convenience re-exports for downstream crates
pub use audio::{
    list_input_devices, list_output_devices, AnalyzerHandle, AudioBackend, CaptureHandle,
    CaptureSink, CpalBackend, DeviceInfo, PlaybackHandle,
};
pub use channel::{Channel, ChannelState};
pub use error::{Result, VoxError};
pub use ipc::events::{CaptureActivityEvent, SessionStatus, SessionStatusEvent};
pub use protocol::{Envelope, EnvelopeKind};
pub use session::{
    config::{SessionConfig, VoiceSettings},
    diagnostics::DiagnosticsSnapshot,
    handler::{handler_fn, EnvelopeHandler},
    SessionController, SessionControllerBuilder,
};
