//! Audio device enumeration and lookup.

use serde::{Deserialize, Serialize};

/// Device id that always resolves to the host's default device.
pub const DEFAULT_DEVICE: &str = "default";

/// Which side of the audio graph a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS. Also the id accepted
    /// by `SessionConfig::input_device`.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Heuristic flag for inputs that likely capture system/output audio.
    pub is_loopback_like: bool,
    /// Heuristic recommendation for best speech microphone input.
    pub is_recommended: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "virtual output",
    "monitor of",
    "speakers (",
    "headphones (",
];

const MIC_POSITIVE_KEYWORDS: &[&str] = &[
    "microphone",
    "mic",
    "array",
    "headset",
    "input",
    "usb",
    "webcam",
];

/// `true` for ids that mean "whatever the host considers default".
pub fn is_default_id(id: &str) -> bool {
    let id = id.trim();
    id.is_empty() || id.eq_ignore_ascii_case(DEFAULT_DEVICE)
}

/// Best-effort heuristic for loopback/system-output capture devices.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Score a device name for likely speech microphone quality/intent.
///
/// Higher is better. Non-loopback devices should be preferred.
pub fn mic_preference_score(name: &str) -> i32 {
    let lowered = name.trim().to_ascii_lowercase();
    let mut score = if is_loopback_like_name(&lowered) { -16 } else { 8 };
    if MIC_POSITIVE_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        score += 6;
    }
    score
}

/// Mark the best microphone candidate and order the list for display.
#[cfg_attr(not(feature = "audio-cpal"), allow(dead_code))]
fn rank_inputs(list: &mut [DeviceInfo]) {
    if let Some(best) = list
        .iter_mut()
        .max_by_key(|d| mic_preference_score(&d.name) + if d.is_default { 2 } else { 0 })
    {
        best.is_recommended = true;
    }

    list.sort_by_key(|d| {
        (
            !d.is_recommended,
            d.is_loopback_like,
            !d.is_default,
            d.name.to_ascii_lowercase(),
        )
    });
}

#[cfg(feature = "audio-cpal")]
mod host {
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::warn;

    use super::*;
    use crate::error::{Result, VoxError};

    fn describe<I: Iterator<Item = cpal::Device>>(
        devices: I,
        direction: DeviceDirection,
        default_name: Option<&str>,
    ) -> Vec<DeviceInfo> {
        devices
            .enumerate()
            .map(|(idx, device)| {
                let name = device
                    .name()
                    .unwrap_or_else(|_| format!("Device {}", idx + 1));
                DeviceInfo {
                    is_default: default_name == Some(name.as_str()),
                    is_loopback_like: direction == DeviceDirection::Input
                        && is_loopback_like_name(&name),
                    is_recommended: false,
                    direction,
                    name,
                }
            })
            .collect()
    }

    pub fn list_input_devices() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_input_device().and_then(|d| d.name().ok());

        match host.input_devices() {
            Ok(devices) => {
                let mut list = describe(devices, DeviceDirection::Input, default_name.as_deref());
                rank_inputs(&mut list);
                list
            }
            Err(e) => {
                warn!("failed to enumerate input devices: {e}");
                vec![]
            }
        }
    }

    pub fn list_output_devices() -> Vec<DeviceInfo> {
        let host = cpal::default_host();
        let default_name = host.default_output_device().and_then(|d| d.name().ok());

        match host.output_devices() {
            Ok(devices) => describe(devices, DeviceDirection::Output, default_name.as_deref()),
            Err(e) => {
                warn!("failed to enumerate output devices: {e}");
                vec![]
            }
        }
    }

    /// Resolve an input device id. Unknown names are an error rather than a
    /// silent fallback: the caller asked for a specific microphone.
    pub fn find_input_device(id: &str) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if is_default_id(id) {
            return host
                .default_input_device()
                .ok_or_else(|| VoxError::DeviceUnavailable("no default input device".into()));
        }
        host.input_devices()
            .map_err(|e| VoxError::DeviceUnavailable(e.to_string()))?
            .find(|d| d.name().map(|n| n == id).unwrap_or(false))
            .ok_or_else(|| VoxError::DeviceUnavailable(format!("input device '{id}' not found")))
    }

    /// Resolve an output device id, falling back to the default output when
    /// the named device is missing.
    pub fn find_output_device(id: Option<&str>) -> Result<cpal::Device> {
        let host = cpal::default_host();
        if let Some(id) = id.filter(|id| !is_default_id(id)) {
            match host.output_devices() {
                Ok(mut devices) => {
                    if let Some(device) =
                        devices.find(|d| d.name().map(|n| n == id).unwrap_or(false))
                    {
                        return Ok(device);
                    }
                    warn!("output device '{id}' not found, falling back to default");
                }
                Err(e) => warn!("failed to list output devices: {e}"),
            }
        }
        host.default_output_device()
            .ok_or_else(|| VoxError::DeviceUnavailable("no default output device".into()))
    }
}

#[cfg(feature = "audio-cpal")]
pub use host::{find_input_device, find_output_device, list_input_devices, list_output_devices};

#[cfg(not(feature = "audio-cpal"))]
pub fn list_input_devices() -> Vec<DeviceInfo> {
    vec![]
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_output_devices() -> Vec<DeviceInfo> {
    vec![]
}
