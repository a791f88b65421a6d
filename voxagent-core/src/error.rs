use thiserror::Error;

use crate::ipc::events::SessionStatus;

/// All errors produced by voxagent-core.
#[derive(Debug, Error)]
pub enum VoxError {
    /// Microphone or speaker could not be acquired (permission denied, no device).
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    /// A send was attempted after the channel was closed.
    #[error("channel is not open")]
    ChannelNotOpen,

    /// Transport-level failure of the duplex channel.
    #[error("channel error: {0}")]
    Channel(String),

    #[error("envelope codec error: {0}")]
    Codec(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("operation not valid while session is {0:?}")]
    InvalidState(SessionStatus),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VoxError {
    /// `true` for failures of the channel itself (as opposed to misuse or local audio).
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, VoxError::Channel(_))
    }
}

pub type Result<T> = std::result::Result<T, VoxError>;
