//! Events broadcast by the voice engine.
//!
//! | Event | Subscribe with |
//! |-------|----------------|
//! | `SessionStatusEvent` | `VoiceEngineHandle::subscribe_status` |
//! | `ActivityEvent` | `VoiceEngineHandle::subscribe_activity` |

use serde::{Deserialize, Serialize};

/// Lifecycle state of a voice session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// No session; `start()` may be called.
    #[default]
    Idle,
    /// Output opened, transport connecting.
    Connecting,
    /// Remote ready; microphone streaming.
    Connected,
    /// Start or session failed. Retry with `start()`.
    Error,
    /// Remote closed the session.
    Disconnected,
}

impl SessionStatus {
    /// States in which `start()` is accepted.
    pub fn can_start(self) -> bool {
        matches!(
            self,
            SessionStatus::Idle | SessionStatus::Error | SessionStatus::Disconnected
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Error => "error",
            SessionStatus::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Emitted on `"counsel://status"` whenever the session state changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatusEvent {
    pub status: SessionStatus,
    /// Human-readable detail, e.g. the error message.
    pub detail: Option<String>,
    /// Set on the event produced by `end()`, telling the host the session is over.
    #[serde(default)]
    pub ended: bool,
}

/// Emitted on `"counsel://activity"` for every captured frame and every
/// change in speaking state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityEvent {
    pub seq: u64,
    pub rms: f32,
    /// User voice detected in the latest captured frame.
    pub is_listening: bool,
    /// Assistant audio is streaming in.
    pub is_speaking: bool,
    /// Indicator level in [0, 1].
    pub volume: f32,
}

/// Read-only view of the session for the host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub detail: Option<String>,
    pub is_speaking: bool,
    pub is_listening: bool,
    pub volume: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_event_serializes_with_lowercase_status() {
        let event = SessionStatusEvent {
            status: SessionStatus::Disconnected,
            detail: Some("remote closed".into()),
            ended: false,
        };

        let json = serde_json::to_value(&event).expect("serialize status event");
        assert_eq!(json["status"], "disconnected");
        assert_eq!(json["detail"], "remote closed");
        assert_eq!(json["ended"], false);

        let round_trip: SessionStatusEvent =
            serde_json::from_value(json).expect("deserialize status event");
        assert_eq!(round_trip, event);
    }

    #[test]
    fn status_rejects_non_lowercase_values() {
        assert!(serde_json::from_str::<SessionStatus>(r#""Connected""#).is_err());
        assert_eq!(
            serde_json::from_str::<SessionStatus>(r#""connected""#).unwrap(),
            SessionStatus::Connected
        );
    }

    #[test]
    fn activity_event_uses_camel_case_fields() {
        let event = ActivityEvent {
            seq: 3,
            rms: 0.18,
            is_listening: true,
            is_speaking: false,
            volume: 0.9,
        };
        let json = serde_json::to_value(&event).expect("serialize activity event");
        assert_eq!(json["seq"], 3);
        assert_eq!(json["isListening"], true);
        assert_eq!(json["isSpeaking"], false);
        let volume = json["volume"].as_f64().expect("volume is a number");
        assert!((volume - 0.9).abs() < 1e-5);
    }

    #[test]
    fn only_resting_states_accept_start() {
        assert!(SessionStatus::Idle.can_start());
        assert!(SessionStatus::Error.can_start());
        assert!(SessionStatus::Disconnected.can_start());
        assert!(!SessionStatus::Connecting.can_start());
        assert!(!SessionStatus::Connected.can_start());
    }
}
