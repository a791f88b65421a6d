//! Events published by the session controller for UI layers.
//!
//! These never travel over the backend channel; hosts subscribe through
//! `SessionController::subscribe_status` / `subscribe_activity` and forward
//! them to whatever surface they render.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Session status events
// ---------------------------------------------------------------------------

/// Emitted whenever the session lifecycle changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Optional human-readable detail (e.g. the error that ended a session).
    pub detail: Option<String>,
}

/// Lifecycle state of a `SessionController`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No session; `start()` may be called.
    Idle,
    /// Channel opening, devices being acquired, handshake in flight.
    Connecting,
    /// Live call: capture is streaming and inbound envelopes are routed.
    Active,
    /// Teardown in progress.
    Closing,
    /// The backend closed the channel or the transport failed while active.
    /// Resources are still held until `stop()` or a new `start()`.
    Disconnected,
}

// ---------------------------------------------------------------------------
// Capture activity events
// ---------------------------------------------------------------------------

/// Emitted for every chunk of microphone audio reaching the capture sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureActivityEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    /// Root-mean-square level of the chunk in [0.0, 1.0].
    pub rms: f32,
    /// Whether the chunk was discarded by the mute gate.
    pub muted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = SessionStatusEvent {
            status: SessionStatus::Disconnected,
            detail: Some("channel error: reset".into()),
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "disconnected");
        assert_eq!(json["detail"], "channel error: reset");

        let round_trip: SessionStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip.status, SessionStatus::Disconnected);
    }

    #[test]
    fn status_rejects_non_lowercase_values() {
        let err = serde_json::from_str::<SessionStatus>(r#""Active""#);
        assert!(err.is_err(), "expected invalid casing to fail");
    }

    #[test]
    fn activity_event_uses_camel_case() {
        let event = CaptureActivityEvent {
            seq: 3,
            rms: 0.25,
            muted: true,
        };
        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["muted"], true);
        let rms = json["rms"].as_f64().expect("rms should serialize as number");
        assert!((rms - 0.25).abs() < 1e-6);
    }
}
