//! Session configuration.
//!
//! [`SessionConfig`] is everything a controller needs to open a session; it
//! is passed in explicitly rather than read from ambient storage.
//! [`VoiceSettings`] is the typed form of the settings map most hosts send.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::audio::device::DEFAULT_DEVICE;
use crate::error::{Result, VoxError};

/// Parameters for one controller.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Backend base URL, `ws://` or `wss://`.
    pub endpoint: String,
    /// Opaque per-user key; becomes the last path segment of the session URL
    /// and the id of the initial `settings` envelope.
    pub identity: String,
    /// Forwarded verbatim in the initial `settings` envelope.
    pub settings: Map<String, Value>,
    /// Input device used when `start` is called without an override.
    pub input_device: String,
    /// Microphone mute state when the controller is created.
    pub start_muted: bool,
}

impl SessionConfig {
    pub fn new(endpoint: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity: identity.into(),
            settings: Map::new(),
            input_device: DEFAULT_DEVICE.to_string(),
            start_muted: true,
        }
    }

    pub fn with_settings(mut self, settings: Map<String, Value>) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_input_device(mut self, device: impl Into<String>) -> Self {
        self.input_device = device.into();
        self
    }

    pub fn with_start_muted(mut self, muted: bool) -> Self {
        self.start_muted = muted;
        self
    }

    /// `{endpoint}/session/{identity}`, with any trailing `/` on the
    /// endpoint removed.
    ///
    /// # Errors
    /// `InvalidConfig` for a non-WebSocket endpoint or an empty identity or
    /// one containing `/`.
    pub fn session_url(&self) -> Result<String> {
        let endpoint = self.endpoint.trim().trim_end_matches('/');
        if !(endpoint.starts_with("ws://") || endpoint.starts_with("wss://")) {
            return Err(VoxError::InvalidConfig(format!(
                "endpoint must start with ws:// or wss://, got '{endpoint}'"
            )));
        }
        let identity = self.identity.trim();
        if identity.is_empty() || identity.contains('/') {
            return Err(VoxError::InvalidConfig(format!(
                "identity must be a non-empty path segment, got '{identity}'"
            )));
        }
        Ok(format!("{endpoint}/session/{identity}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    #[default]
    ServerVad,
    SemanticVad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Eagerness {
    Low,
    Medium,
    High,
    #[default]
    Auto,
}

pub const VOICES: &[&str] = &[
    "alloy", "ash", "ballad", "coral", "echo", "sage", "shimmer", "verse",
];

/// Turn-detection and voice options for the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    pub detection_type: DetectionType,
    pub transcription_model: String,
    /// Server VAD activation threshold in [0, 1].
    pub threshold: f64,
    /// Silence (ms) that ends a user turn.
    pub silence_duration: u32,
    /// Audio (ms) kept before detected speech.
    pub prefix_padding: u32,
    pub eagerness: Eagerness,
    pub voice: String,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            detection_type: DetectionType::ServerVad,
            transcription_model: "whisper-1".into(),
            threshold: 0.8,
            silence_duration: 500,
            prefix_padding: 300,
            eagerness: Eagerness::Auto,
            voice: "sage".into(),
        }
    }
}

impl VoiceSettings {
    pub fn normalize(&mut self) {
        let defaults = Self::default();
        if !self.threshold.is_finite() {
            self.threshold = defaults.threshold;
        }
        self.threshold = self.threshold.clamp(0.0, 1.0);
        self.silence_duration = self.silence_duration.clamp(100, 5_000);
        self.prefix_padding = self.prefix_padding.min(2_000);
        if self.transcription_model.trim().is_empty() {
            self.transcription_model = defaults.transcription_model;
        }
        self.voice = self.voice.trim().to_ascii_lowercase();
        if !VOICES.contains(&self.voice.as_str()) {
            self.voice = defaults.voice;
        }
    }

    /// Settings map for the session-start envelope: these options plus the
    /// user's display name and the local date and time.
    pub fn to_session_settings(&self, user: &str, now: DateTime<Local>) -> Map<String, Value> {
        let mut map = match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        };
        map.insert("user".into(), Value::String(user.to_string()));
        map.insert(
            "date".into(),
            Value::String(now.format("%Y-%m-%d").to_string()),
        );
        map.insert(
            "time".into(),
            Value::String(now.format("%H:%M:%S").to_string()),
        );
        map
    }
}
