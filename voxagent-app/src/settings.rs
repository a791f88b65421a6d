//! Persistent application settings (JSON file in app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use voxagent_core::{SessionConfig, VoiceSettings};

pub const DEFAULT_ENDPOINT: &str = "ws://localhost:8000";
pub const DEFAULT_USER: &str = "guest";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub endpoint: String,
    /// Per-user session key issued by the backend.
    pub identity: String,
    /// Display name sent in the session settings.
    pub user: String,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub start_muted: bool,
    pub voice: VoiceSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.into(),
            identity: String::new(),
            user: DEFAULT_USER.into(),
            preferred_input_device: None,
            preferred_output_device: None,
            start_muted: true,
            voice: VoiceSettings::default(),
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.endpoint = normalize_endpoint(&self.endpoint);
        self.identity = self.identity.trim().to_string();
        self.user = match self.user.trim() {
            "" => DEFAULT_USER.into(),
            user => user.to_string(),
        };
        self.preferred_input_device = normalize_device(self.preferred_input_device.as_deref());
        self.preferred_output_device = normalize_device(self.preferred_output_device.as_deref());
        self.voice.normalize();
    }

    /// Overlay `VOXAGENT_*` variables from `lookup` on top of the file values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup("VOXAGENT_ENDPOINT") {
            self.endpoint = endpoint;
        }
        if let Some(identity) = lookup("VOXAGENT_IDENTITY") {
            self.identity = identity;
        }
        if let Some(user) = lookup("VOXAGENT_USER") {
            self.user = user;
        }
        if let Some(device) = lookup("VOXAGENT_INPUT_DEVICE") {
            self.preferred_input_device = Some(device);
        }
        self.normalize();
    }

    /// Controller configuration for a session opened at `now`.
    pub fn session_config(&self, now: DateTime<Local>) -> SessionConfig {
        let mut config = SessionConfig::new(&self.endpoint, &self.identity)
            .with_settings(self.voice.to_session_settings(&self.user, now))
            .with_start_muted(self.start_muted);
        if let Some(device) = &self.preferred_input_device {
            config = config.with_input_device(device);
        }
        config
    }
}

pub fn normalize_endpoint(raw: &str) -> String {
    let endpoint = raw.trim().trim_end_matches('/');
    if endpoint.is_empty() {
        return DEFAULT_ENDPOINT.into();
    }
    // Accept the HTTP form of the same host; the session runs over WebSocket.
    if let Some(rest) = endpoint.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        endpoint.to_string()
    }
}

fn normalize_device(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|d| !d.is_empty())
        .map(str::to_string)
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxagent")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("voxagent")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
