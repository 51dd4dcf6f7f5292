//! Bidirectional streaming session transport.
//!
//! The controller only sees [`LiveConnector`] and [`LiveSession`]; concrete
//! backends live in submodules. Inbound traffic arrives as [`SessionEvent`]s
//! on an unbounded channel so the reader task never waits on the controller.

pub mod gemini;

pub use gemini::GeminiLiveConnector;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::codec::EncodedFrame;
use crate::error::Result;

/// Parameters sent to the remote service when a session opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveConfig {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    /// Always `"AUDIO"` for voice sessions.
    pub response_modality: String,
}

impl LiveConfig {
    pub fn audio(model: impl Into<String>, voice_name: impl Into<String>, system_instruction: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            voice_name: voice_name.into(),
            system_instruction: system_instruction.into(),
            response_modality: "AUDIO".into(),
        }
    }
}

/// One server message, reduced to what the voice pipeline acts on.
///
/// Any subset of the fields may be set at once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundMessage {
    /// Base64 PCM16 24 kHz payloads, in arrival order.
    pub audio: Vec<String>,
    pub interrupted: bool,
    pub turn_complete: bool,
}

impl InboundMessage {
    pub fn is_empty(&self) -> bool {
        self.audio.is_empty() && !self.interrupted && !self.turn_complete
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The remote side accepted the setup and is ready for audio.
    Open,
    Message(InboundMessage),
    /// Clean close from either side.
    Closed,
    Error(String),
}

/// A connected session and its inbound event stream.
pub struct LiveLink {
    pub session: Box<dyn LiveSession>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// # Errors
    /// `CredentialMissing` without a key, `ConnectionFailed` when the
    /// remote cannot be reached.
    async fn connect(&self, config: &LiveConfig) -> Result<LiveLink>;
}

/// Outbound half of a session. Only the controller sends or closes.
pub trait LiveSession: Send {
    /// Queue one captured frame. Does not wait for acknowledgement.
    fn send_realtime_input(&mut self, frame: &EncodedFrame) -> Result<()>;

    /// Ask the remote to close. Further sends fail; repeating is a no-op.
    fn close(&mut self);
}
