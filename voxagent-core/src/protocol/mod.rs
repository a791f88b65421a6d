//! Wire protocol exchanged with the agent backend.
//!
//! One [`Envelope`] per WebSocket text frame, JSON encoded, discriminated by
//! its `type` field. Audio travels base64-encoded inside `audio.content`, so
//! the protocol never uses binary frames.

pub mod envelope;

pub use envelope::{
    AgentContent, AgentStatus, AudioFrame, ConsoleEnvelope, ContentBlock, ContentKind, Envelope,
    EnvelopeKind, ErrorEnvelope, FunctionCall, FunctionCompletion, Interrupt, MessageEnvelope,
    OutputItem, Role, SettingsEnvelope,
};
